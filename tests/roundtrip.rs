//! End-to-end roundtrips through the full envelope pipeline.

use std::io::{Seek, SeekFrom};

use graphpack::{
    decode_from, decode_from_slice, encode_to, encode_to_vec, DType, DecodeOptions,
    EncodeOptions, Storage, TableKey, Tensor, Value,
};

fn roundtrip(value: &Value) -> Value {
    let bytes = encode_to_vec(value, &EncodeOptions::default()).unwrap();
    decode_from_slice(&bytes, &DecodeOptions::default()).unwrap()
}

#[test]
fn nested_mixed_table() {
    let inner = Value::table();
    {
        let mut t = inner.as_table().unwrap().borrow_mut();
        t.set(TableKey::int(1), Value::str("alpha"));
        t.set(TableKey::int(2), Value::str("beta"));
        t.set(TableKey::int(100), Value::Number(100.0));
        t.set(TableKey::Num(0.5), Value::Bool(true));
        t.set(TableKey::Bool(false), Value::str("f"));
    }
    let outer = Value::table();
    {
        let mut t = outer.as_table().unwrap().borrow_mut();
        t.set(TableKey::str("inner"), inner);
        t.set(TableKey::str("n"), Value::Number(-1.25));
        t.set(TableKey::str("big"), Value::str(vec![b'q'; 5000]));
    }
    assert!(roundtrip(&outer).structural_eq(&outer));
}

#[test]
fn aliasing_and_cycles_survive() {
    let a = Value::table();
    let b = Value::table();
    a.as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::str("b"), b.clone());
    b.as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::str("a"), a.clone());

    let root = Value::table();
    {
        let mut t = root.as_table().unwrap().borrow_mut();
        t.set(TableKey::str("first"), a.clone());
        t.set(TableKey::str("second"), a);
    }

    let out = roundtrip(&root);
    let t = out.as_table().unwrap().borrow();
    let first = t.get(&TableKey::str("first")).unwrap();
    let second = t.get(&TableKey::str("second")).unwrap();
    assert_eq!(first.identity(), second.identity());

    // a -> b -> a comes back as the same two-node cycle.
    let b_out = first
        .as_table()
        .unwrap()
        .borrow()
        .get(&TableKey::str("b"))
        .unwrap();
    let a_again = b_out
        .as_table()
        .unwrap()
        .borrow()
        .get(&TableKey::str("a"))
        .unwrap();
    assert_eq!(a_again.identity(), first.identity());
}

#[test]
fn table_as_key() {
    let key = Value::table();
    key.as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::str("marker"), Value::Number(3.0));

    let t = Value::table();
    t.as_table()
        .unwrap()
        .borrow_mut()
        .set(TableKey::from_value(&key).unwrap(), Value::str("val"));

    let out = roundtrip(&t);
    let table = out.as_table().unwrap().borrow();
    assert_eq!(table.len(), 1);
    let (out_key, out_val) = {
        let (k, v) = table.iter().next().unwrap();
        (k.to_value(), v.clone())
    };
    assert!(out_key.structural_eq(&key));
    assert!(out_val.structural_eq(&Value::str("val")));
}

#[test]
fn tensors_and_storages() {
    let data: Vec<u8> = (0..48).collect();
    let tensor = Tensor::new(DType::F32, vec![3, 4], data).unwrap();
    let storage = Storage::new(DType::I64, vec![7u8; 32]).unwrap();

    let t = Value::table();
    {
        let mut table = t.as_table().unwrap().borrow_mut();
        table.set(
            TableKey::str("tensor"),
            Value::Tensor(std::rc::Rc::new(std::cell::RefCell::new(tensor))),
        );
        table.set(
            TableKey::str("storage"),
            Value::Storage(std::rc::Rc::new(std::cell::RefCell::new(storage))),
        );
    }
    assert!(roundtrip(&t).structural_eq(&t));
}

#[test]
fn shared_tensor_decodes_once() {
    let tensor = Value::Tensor(std::rc::Rc::new(std::cell::RefCell::new(
        Tensor::new(DType::U8, vec![4], vec![1, 2, 3, 4]).unwrap(),
    )));
    let t = Value::table();
    {
        let mut table = t.as_table().unwrap().borrow_mut();
        table.set(TableKey::int(1), tensor.clone());
        table.set(TableKey::int(2), tensor);
    }
    let out = roundtrip(&t);
    let table = out.as_table().unwrap().borrow();
    assert_eq!(
        table.get_int(1).unwrap().identity(),
        table.get_int(2).unwrap().identity()
    );
}

#[test]
fn functions_with_upvalues() {
    let shared = Value::str(vec![b's'; 200]);
    let f = Value::function(
        b"\x1bLfake-code".to_vec(),
        vec![shared.clone(), Value::Number(2.0), shared],
    );
    let out = roundtrip(&f);
    assert!(out.structural_eq(&f));
    match out {
        Value::Function(rc) => {
            let func = rc.borrow();
            assert_eq!(
                func.upvalues[0].identity(),
                func.upvalues[2].identity()
            );
        }
        _ => panic!("expected function"),
    }
}

#[test]
fn nil_values_absent_after_roundtrip() {
    let t = Value::table();
    {
        let mut table = t.as_table().unwrap().borrow_mut();
        table.set(TableKey::str("kept"), Value::Number(1.0));
        table.set(TableKey::str("gone"), Value::Bool(true));
        table.set(TableKey::str("gone"), Value::Nil);
    }
    let out = roundtrip(&t);
    let table = out.as_table().unwrap().borrow();
    assert_eq!(table.len(), 1);
    assert!(table.get(&TableKey::str("gone")).is_none());
}

#[test]
fn file_roundtrip() {
    let t = Value::table();
    for i in 1..=50 {
        t.as_table()
            .unwrap()
            .borrow_mut()
            .set(TableKey::int(i), Value::Number(i as f64 * 0.5));
    }

    let mut file = tempfile::tempfile().unwrap();
    encode_to(&mut file, &t, &EncodeOptions::default()).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let out = decode_from(&mut file, &DecodeOptions::default()).unwrap();
    assert!(out.structural_eq(&t));
}

#[test]
fn multiple_envelopes_in_one_stream() {
    let mut buf = Vec::new();
    encode_to(&mut buf, &Value::Number(1.0), &EncodeOptions::default()).unwrap();
    encode_to(&mut buf, &Value::str("second"), &EncodeOptions::default()).unwrap();

    let mut reader = &buf[..];
    let first = decode_from(&mut reader, &DecodeOptions::default()).unwrap();
    let second = decode_from(&mut reader, &DecodeOptions::default()).unwrap();
    assert!(first.structural_eq(&Value::Number(1.0)));
    assert!(second.structural_eq(&Value::str("second")));
    assert!(reader.is_empty());
}
