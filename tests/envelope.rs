//! Envelope-level behavior: codecs, chunking, version gating, and the
//! runtime fingerprint policy.

use graphpack::envelope::header;
use graphpack::{
    decode_from_slice, encode_to_vec, Codec, DType, DecodeOptions, EncodeOptions, Error,
    TableKey, Tensor, Value, VersionInfo, MAX_FORMAT_VERSION,
};

fn sample() -> Value {
    let t = Value::table();
    {
        let mut table = t.as_table().unwrap().borrow_mut();
        table.set(TableKey::str("text"), Value::str(vec![b'a'; 10_000]));
        table.set(TableKey::int(1), Value::Number(1.0));
    }
    t
}

#[test]
fn all_codecs_roundtrip() {
    let value = sample();
    for codec in [Codec::None, Codec::Lz4, Codec::Zstd] {
        let options = EncodeOptions {
            codec,
            ..Default::default()
        };
        let bytes = encode_to_vec(&value, &options).unwrap();
        let out = decode_from_slice(&bytes, &DecodeOptions::default()).unwrap();
        assert!(out.structural_eq(&value), "codec {codec:?}");
    }
}

#[test]
fn large_payload_chunks_and_reassembles() {
    // ~1 MiB of poorly compressible tensor data, 256 KiB chunks.
    let data: Vec<u8> = (0..1_048_576u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    let tensor = Tensor::new(DType::U8, vec![data.len() as i64], data).unwrap();
    let value = Value::table();
    value.as_table().unwrap().borrow_mut().set(
        TableKey::str("t"),
        Value::Tensor(std::rc::Rc::new(std::cell::RefCell::new(tensor))),
    );

    let options = EncodeOptions {
        chunk_len: Some(256 * 1024),
        ..Default::default()
    };
    let bytes = encode_to_vec(&value, &options).unwrap();

    let head = header::read_header(&mut &bytes[..]).unwrap();
    assert!(head.format_version >= 2);
    assert!(head.chunks.as_ref().unwrap().len() >= 4);

    let out = decode_from_slice(&bytes, &DecodeOptions::default()).unwrap();
    assert!(out.structural_eq(&value));
}

#[test]
fn bad_magic_rejected() {
    let mut bytes = encode_to_vec(&Value::Nil, &EncodeOptions::default()).unwrap();
    bytes[1] = b'?';
    assert!(matches!(
        decode_from_slice(&bytes, &DecodeOptions::default()),
        Err(Error::InvalidMagic(_))
    ));
}

#[test]
fn future_format_version_rejected_before_payload() {
    // An envelope claiming version 999 over a garbage payload: the version
    // check must fire without the payload ever being touched.
    let head = graphpack::Header {
        format_version: 999,
        codec: Codec::Lz4,
        uncompressed_len: 4,
        compressed_len: 4,
        version_info: VersionInfo::default(),
        chunks: None,
    };
    let mut bytes = Vec::new();
    header::write_header(&mut bytes, &head).unwrap();
    bytes.extend_from_slice(&[0xFF; 4]);

    assert!(matches!(
        decode_from_slice(&bytes, &DecodeOptions::default()),
        Err(Error::VersionMismatch {
            version: 999,
            max_supported: MAX_FORMAT_VERSION
        })
    ));
}

#[test]
fn hostile_uncompressed_len_rejected() {
    // Header length fields are attacker-controlled: a huge claimed payload
    // size must fail as malformed before it can size any buffer.
    let compressed = Codec::Lz4.compress(b"tiny").unwrap();
    for claimed in [u64::MAX, 1 << 44] {
        let head = graphpack::Header {
            format_version: 0,
            codec: Codec::Lz4,
            uncompressed_len: claimed,
            compressed_len: compressed.len() as u64,
            version_info: VersionInfo::default(),
            chunks: None,
        };
        let mut bytes = Vec::new();
        header::write_header(&mut bytes, &head).unwrap();
        bytes.extend_from_slice(&compressed);

        assert!(matches!(
            decode_from_slice(&bytes, &DecodeOptions::default()),
            Err(Error::Malformed(_))
        ));
    }
}

#[test]
fn payload_limit_is_configurable() {
    let value = sample();
    let bytes = encode_to_vec(&value, &EncodeOptions::default()).unwrap();

    let tight = DecodeOptions {
        max_payload_len: 16,
        ..Default::default()
    };
    assert!(matches!(
        decode_from_slice(&bytes, &tight),
        Err(Error::Malformed(_))
    ));
    assert!(decode_from_slice(&bytes, &DecodeOptions::default()).is_ok());
}

#[test]
fn writer_version_cap() {
    // A graph needing only version 0 encodes under a cap of 0.
    let plain = Value::Number(7.0);
    let options = EncodeOptions {
        max_version: 0,
        ..Default::default()
    };
    assert!(encode_to_vec(&plain, &options).is_ok());

    // Chunking needs version 2, so a cap of 1 refuses.
    let value = sample();
    let options = EncodeOptions {
        max_version: 1,
        chunk_len: Some(1024),
        ..Default::default()
    };
    assert!(matches!(
        encode_to_vec(&value, &options),
        Err(Error::VersionMismatch {
            version: 2,
            max_supported: 1
        })
    ));
}

#[test]
fn truncated_envelope_rejected() {
    let bytes = encode_to_vec(&sample(), &EncodeOptions::default()).unwrap();
    let err = decode_from_slice(&bytes[..bytes.len() - 5], &DecodeOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[test]
fn corrupted_payload_rejected() {
    // Uncompressed so the corruption lands in payload bytes directly: the
    // reference count is inflated past what the payload can hold.
    let options = EncodeOptions {
        codec: Codec::None,
        ..Default::default()
    };
    let mut bytes = encode_to_vec(&Value::Number(5.0), &options).unwrap();
    let header_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    bytes[8 + header_len] = 0xFF;
    assert!(matches!(
        decode_from_slice(&bytes, &DecodeOptions::default()),
        Err(Error::Malformed(_))
    ));
}

#[test]
fn fingerprint_gates_functions_only() {
    let producer = VersionInfo::new("5.2", b"code-format-7");
    let consumer = VersionInfo::new("5.3", b"code-format-8");

    // Function-free graphs decode across the mismatch.
    let plain = sample();
    let bytes = encode_to_vec(
        &plain,
        &EncodeOptions {
            version_info: producer.clone(),
            ..Default::default()
        },
    )
    .unwrap();
    let out = decode_from_slice(
        &bytes,
        &DecodeOptions {
            version_info: Some(consumer.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(out.structural_eq(&plain));

    // A graph with a function does not.
    let f = Value::function(vec![1, 2, 3], Vec::new());
    let bytes = encode_to_vec(
        &f,
        &EncodeOptions {
            version_info: producer.clone(),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(
        decode_from_slice(
            &bytes,
            &DecodeOptions {
                version_info: Some(consumer),
                ..Default::default()
            },
        ),
        Err(Error::FingerprintMismatch { .. })
    ));

    // The same envelope decodes under a matching fingerprint.
    let out = decode_from_slice(
        &bytes,
        &DecodeOptions {
            version_info: Some(producer),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(out.structural_eq(&f));
}

#[test]
fn skip_code_rejects_functions() {
    let f = Value::function(vec![1], Vec::new());
    let bytes = encode_to_vec(&f, &EncodeOptions::default()).unwrap();
    assert!(matches!(
        decode_from_slice(
            &bytes,
            &DecodeOptions {
                skip_code: true,
                ..Default::default()
            },
        ),
        Err(Error::UnsupportedType(_))
    ));
}

#[test]
fn env_locations_through_the_envelope() {
    let module = Value::table();
    let root = Value::table();
    root.as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::str("os"), module.clone());

    let options = EncodeOptions {
        inverted_env: vec![(module.clone(), (Value::str("globals"), Value::str("os")))],
        ..Default::default()
    };
    let bytes = encode_to_vec(&root, &options).unwrap();
    let head = header::read_header(&mut &bytes[..]).unwrap();
    assert_eq!(head.format_version, 3);

    let inner = Value::table();
    inner
        .as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::str("os"), module.clone());
    let env = Value::table();
    env.as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::str("globals"), inner);

    let out = decode_from_slice(
        &bytes,
        &DecodeOptions {
            env: Some(env),
            ..Default::default()
        },
    )
    .unwrap();
    let resolved = out
        .as_table()
        .unwrap()
        .borrow()
        .get(&TableKey::str("os"))
        .unwrap();
    assert_eq!(resolved.identity(), module.identity());
}
