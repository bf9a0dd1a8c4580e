//! CHECKSIG and CHECKMULTISIG behavior against the default crypto provider:
//! the two-pointer key matching, operand ordering, step accounting, and the
//! count preconditions.

use scriptvm::{
    FaultReason, Interpreter, OpCode, ScriptBuilder, StackItem, StdCrypto, MAX_STEPS,
};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

const MESSAGE: &[u8] = b"0.5 units from alice to bob, nonce 7";

fn key_pair(seed: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).expect("non-zero seed");
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

fn sign(message: &[u8], sk: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::new();
    let digest: [u8; 32] = Sha256::digest(message).into();
    secp.sign_ecdsa(&Message::from_digest(digest), sk)
        .serialize_compact()
        .to_vec()
}

fn run(script: &[u8]) -> (bool, FaultReason, Vec<StackItem>, usize) {
    let message = MESSAGE.to_vec();
    let mut engine = Interpreter::new(&message, &StdCrypto);
    let ok = engine.execute_script(script, false);
    (
        ok,
        engine.last_fault(),
        engine.stack().to_vec(),
        engine.op_count(),
    )
}

/// Script layout: sig_1 .. sig_m, m, key_1 .. key_n, n, CHECKMULTISIG.
fn multisig_script(signatures: &[Vec<u8>], pubkeys: &[PublicKey]) -> Vec<u8> {
    let mut builder = ScriptBuilder::new();
    for signature in signatures {
        builder = builder.push_data(signature);
    }
    builder = builder.push_int(signatures.len() as i64);
    for pubkey in pubkeys {
        builder = builder.push_data(&pubkey.serialize());
    }
    builder
        .push_int(pubkeys.len() as i64)
        .emit(OpCode::CheckMultiSig)
        .into_script()
}

#[test]
fn checksig_pops_pubkey_then_signature() {
    let (sk, pk) = key_pair(1);
    let script = ScriptBuilder::new()
        .push_data(&sign(MESSAGE, &sk))
        .push_data(&pk.serialize())
        .emit(OpCode::CheckSig)
        .into_script();
    let (ok, _, stack, _) = run(&script);
    assert!(ok);
    assert_eq!(stack, vec![StackItem::from(true)]);
}

#[test]
fn checksig_rejects_corrupted_signature() {
    let (sk, pk) = key_pair(1);
    let mut signature = sign(MESSAGE, &sk);
    signature[12] ^= 0x01;
    let script = ScriptBuilder::new()
        .push_data(&signature)
        .push_data(&pk.serialize())
        .emit(OpCode::CheckSig)
        .into_script();
    let (ok, _, stack, _) = run(&script);
    assert!(ok, "a failed signature pushes false, it does not fault");
    assert_eq!(stack, vec![StackItem::from(false)]);
}

#[test]
fn checksig_underflow_faults() {
    let (_, pk) = key_pair(1);
    let script = ScriptBuilder::new()
        .push_data(&pk.serialize())
        .emit(OpCode::CheckSig)
        .into_script();
    let (ok, fault, _, _) = run(&script);
    assert!(!ok);
    assert_eq!(fault, FaultReason::StackUnderflow);
}

#[test]
fn multisig_m_of_n_in_key_order_succeeds() {
    for (m, n) in [(1usize, 1usize), (1, 2), (2, 2), (2, 3), (3, 5)] {
        let keys: Vec<_> = (0..n).map(|i| key_pair(i as u8 + 1)).collect();
        let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
        // Sign with the first m keys, in key order.
        let signatures: Vec<_> = keys[..m].iter().map(|(sk, _)| sign(MESSAGE, sk)).collect();

        let (ok, fault, stack, _) = run(&multisig_script(&signatures, &pubkeys));
        assert!(ok, "{m}-of-{n}: {fault:?}");
        assert_eq!(stack, vec![StackItem::from(true)], "{m}-of-{n}");
    }
}

#[test]
fn multisig_accepts_any_key_subset_in_order() {
    // 2-of-3 signed by the first and third key.
    let keys: Vec<_> = (1u8..=3).map(key_pair).collect();
    let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
    let signatures = vec![sign(MESSAGE, &keys[0].0), sign(MESSAGE, &keys[2].0)];

    let (ok, _, stack, _) = run(&multisig_script(&signatures, &pubkeys));
    assert!(ok);
    assert_eq!(stack, vec![StackItem::from(true)]);
}

#[test]
fn multisig_out_of_key_order_pushes_false() {
    // The signature pointer cannot go back: swapped signatures fail.
    let keys: Vec<_> = (1u8..=2).map(key_pair).collect();
    let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
    let signatures = vec![sign(MESSAGE, &keys[1].0), sign(MESSAGE, &keys[0].0)];

    let (ok, _, stack, _) = run(&multisig_script(&signatures, &pubkeys));
    assert!(ok);
    assert_eq!(stack, vec![StackItem::from(false)]);
}

#[test]
fn multisig_wrong_signature_pushes_false() {
    let keys: Vec<_> = (1u8..=2).map(key_pair).collect();
    let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
    let (outsider, _) = key_pair(9);
    let signatures = vec![sign(MESSAGE, &keys[0].0), sign(MESSAGE, &outsider)];

    let (ok, _, stack, _) = run(&multisig_script(&signatures, &pubkeys));
    assert!(ok);
    assert_eq!(stack, vec![StackItem::from(false)]);
}

#[test]
fn multisig_zero_keys_faults() {
    let script = ScriptBuilder::new()
        .push_int(0)
        .emit(OpCode::CheckMultiSig)
        .into_script();
    let (ok, fault, _, _) = run(&script);
    assert!(!ok);
    assert_eq!(fault, FaultReason::InvalidOperand);
}

#[test]
fn multisig_more_signatures_than_keys_faults() {
    let keys: Vec<_> = (1u8..=2).map(key_pair).collect();
    let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
    let signatures = vec![
        sign(MESSAGE, &keys[0].0),
        sign(MESSAGE, &keys[1].0),
        sign(MESSAGE, &keys[1].0),
    ];

    let (ok, fault, _, _) = run(&multisig_script(&signatures, &pubkeys));
    assert!(!ok);
    assert_eq!(fault, FaultReason::InvalidOperand);
}

#[test]
fn multisig_charges_key_count_against_step_limit() {
    let keys: Vec<_> = (1u8..=3).map(key_pair).collect();
    let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
    let signatures = vec![sign(MESSAGE, &keys[0].0)];

    let (ok, _, _, op_count) = run(&multisig_script(&signatures, &pubkeys));
    assert!(ok);
    // One for the opcode itself plus one per public key.
    assert_eq!(op_count, 1 + 3);
}

#[test]
fn multisig_key_charge_can_exhaust_step_limit() {
    let keys: Vec<_> = (1u8..=2).map(key_pair).collect();
    let pubkeys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
    let signatures = vec![sign(MESSAGE, &keys[0].0)];

    let mut builder = ScriptBuilder::new();
    for _ in 0..MAX_STEPS - 1 {
        builder = builder.emit(OpCode::Nop);
    }
    for signature in &signatures {
        builder = builder.push_data(signature);
    }
    builder = builder.push_int(1);
    for pubkey in &pubkeys {
        builder = builder.push_data(&pubkey.serialize());
    }
    let script = builder
        .push_int(2)
        .emit(OpCode::CheckMultiSig)
        .into_script();

    let (ok, fault, _, _) = run(&script);
    assert!(!ok, "1199 nops + opcode + 2 keys exceeds the limit");
    assert_eq!(fault, FaultReason::StepLimit);
}
