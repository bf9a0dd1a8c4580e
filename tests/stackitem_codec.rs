//! Canonical integer encoding parity, driven both directly and through the
//! interpreter so the byte-level and value-level views stay in lockstep.

use num_bigint::BigInt;
use scriptvm::{
    decode_integer, encode_integer, Interpreter, OpCode, ScriptBuilder, StackItem, StdCrypto,
};

const VALUES: [i64; 15] = [
    0,
    1,
    -1,
    -2,
    127,
    128,
    -128,
    -255,
    256,
    (1i64 << 15) - 1,
    -(1i64 << 16),
    (1i64 << 24) - 1,
    1i64 << 31,
    1 - (1i64 << 32),
    1i64 << 40,
];

fn run(script: &[u8]) -> (bool, Vec<StackItem>) {
    let message: Vec<u8> = Vec::new();
    let mut engine = Interpreter::new(&message, &StdCrypto);
    let ok = engine.execute_script(script, false);
    (ok, engine.stack().to_vec())
}

#[test]
fn encode_decode_round_trips_on_value_table() {
    for value in VALUES {
        let n = BigInt::from(value);
        let encoded = encode_integer(&n);
        assert_eq!(decode_integer(&encoded), n, "round trip {value}");
        // Canonical form is minimal: re-encoding the decoded value is
        // byte-identical.
        assert_eq!(encode_integer(&decode_integer(&encoded)), encoded);
    }
}

#[test]
fn encoding_is_little_endian_twos_complement() {
    let expectations: [(i64, &[u8]); 8] = [
        (0, &[]),
        (1, &[0x01]),
        (-1, &[0xFF]),
        (127, &[0x7F]),
        (128, &[0x80, 0x00]),
        (-128, &[0x80]),
        (256, &[0x00, 0x01]),
        (-256, &[0x00, 0xFF]),
    ];
    for (value, expected) in expectations {
        assert_eq!(encode_integer(&BigInt::from(value)), expected, "{value}");
    }
}

#[test]
fn pushed_bytes_decode_as_integers_in_the_vm() {
    for value in VALUES {
        let encoded = encode_integer(&BigInt::from(value));
        // A byte-string pushed raw must compare numerically equal to the
        // same value rebuilt arithmetically (0 + value).
        let script = ScriptBuilder::new()
            .push_data(&encoded)
            .push_int(0)
            .emit(OpCode::Add)
            .push_data(&encoded)
            .emit(OpCode::NumEqual)
            .into_script();
        let (ok, stack) = run(&script);
        assert!(ok, "{value}");
        assert_eq!(stack, vec![StackItem::from(true)], "{value}");
    }
}

#[test]
fn negate_twice_restores_canonical_bytes() {
    for value in VALUES {
        let encoded = encode_integer(&BigInt::from(value));
        let script = ScriptBuilder::new()
            .push_data(&encoded)
            .emit(OpCode::Negate)
            .emit(OpCode::Negate)
            .into_script();
        let (ok, stack) = run(&script);
        assert!(ok);
        assert_eq!(stack.len(), 1);
        assert_eq!(
            stack[0].to_bytes(),
            Some(encoded.clone()),
            "canonical bytes for {value}"
        );
    }
}

#[test]
fn non_minimal_encodings_normalize_through_arithmetic() {
    // [0x01, 0x00] decodes to 1; adding zero re-encodes minimally.
    let script = ScriptBuilder::new()
        .push_data(&[0x01, 0x00])
        .push_int(0)
        .emit(OpCode::Add)
        .into_script();
    let (ok, stack) = run(&script);
    assert!(ok);
    assert_eq!(stack[0].to_bytes(), Some(vec![0x01]));
}

#[test]
fn empty_string_is_integer_zero_in_the_vm() {
    let script = ScriptBuilder::new()
        .push_data(&[])
        .push_int(0)
        .emit(OpCode::NumEqual)
        .into_script();
    let (ok, stack) = run(&script);
    assert!(ok);
    assert_eq!(stack, vec![StackItem::from(true)]);
}

#[test]
fn wide_integers_round_trip_through_size() {
    // A 33-byte value survives SIZE unharmed next to it.
    let wide = (BigInt::from(1) << 260usize) - 1;
    let encoded = encode_integer(&wide);
    assert_eq!(encoded.len(), 33);
    let script = ScriptBuilder::new()
        .push_data(&encoded)
        .emit(OpCode::Size)
        .into_script();
    let (ok, stack) = run(&script);
    assert!(ok);
    assert_eq!(stack, vec![StackItem::from(33i64)]);
}
