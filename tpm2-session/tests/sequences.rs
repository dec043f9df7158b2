// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Hash and HMAC sequence driving against the software TPM

use tpm2_session::{
    crypto, AuthValue, Config, DigestSource, Error, LoadedObject, SoftTpm, TpmAlgId, TpmCc,
    TpmContext, TpmRc,
};

fn context(tpm: &mut SoftTpm) -> TpmContext<&mut SoftTpm> {
    TpmContext::new(tpm, Config::default())
}

fn input(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_one_shot_and_sequence_agree() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let data = input(1024);

    let one_shot = ctx.digest_slice(DigestSource::Hash(TpmAlgId::Sha256), &data).unwrap();
    let sequence = ctx.hash_sequence_start(&AuthValue::empty(), TpmAlgId::Sha256).unwrap();
    ctx.sequence_update(sequence, &data[..100]).unwrap();
    let chained = ctx.sequence_complete(sequence, &data[100..]).unwrap();

    assert_eq!(one_shot.digest, chained.digest);
    assert_eq!(one_shot.digest, crypto::digest(TpmAlgId::Sha256, &[&data]).unwrap());
    assert!(one_shot.validation.is_some());
    drop(ctx);
    assert_eq!(tpm.command_count(TpmCc::Hash), 1);
}

#[test]
fn test_two_thousand_bytes_take_one_update() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let data = input(2000);
    let output = ctx.digest_slice(DigestSource::Hash(TpmAlgId::Sha256), &data).unwrap();
    assert_eq!(output.digest, crypto::digest(TpmAlgId::Sha256, &[&data]).unwrap());
    drop(ctx);

    assert_eq!(
        tpm.commands(),
        &[
            TpmCc::HashSequenceStart,
            TpmCc::SequenceUpdate,
            TpmCc::SequenceComplete
        ]
    );
    assert_eq!(tpm.sequence_count(), 0);
}

#[test]
fn test_reader_without_size_keeps_last_chunk() {
    let mut tpm = SoftTpm::new();
    let config = Config::default().with_max_buffer(64).unwrap();
    let mut ctx = TpmContext::new(&mut tpm, config);
    let data = input(256);
    let output = ctx
        .digest_reader(DigestSource::Hash(TpmAlgId::Sha384), &mut &data[..], None)
        .unwrap();
    assert_eq!(output.digest, crypto::digest(TpmAlgId::Sha384, &[&data]).unwrap());
    drop(ctx);
    assert_eq!(tpm.command_count(TpmCc::SequenceUpdate), 3);
    assert_eq!(tpm.command_count(TpmCc::SequenceComplete), 1);
}

#[test]
fn test_reader_with_size() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let small = input(10);
    let output = ctx
        .digest_reader(DigestSource::Hash(TpmAlgId::Sha256), &mut &small[..], Some(10))
        .unwrap();
    assert_eq!(output.digest, crypto::digest(TpmAlgId::Sha256, &[&small]).unwrap());

    let large = input(4096);
    let output = ctx
        .digest_reader(DigestSource::Hash(TpmAlgId::Sha512), &mut &large[..], Some(4096))
        .unwrap();
    assert_eq!(output.digest, crypto::digest(TpmAlgId::Sha512, &[&large]).unwrap());

    let err = ctx
        .digest_reader(DigestSource::Hash(TpmAlgId::Sha256), &mut &small[..], Some(11))
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    drop(ctx);
    assert_eq!(tpm.command_count(TpmCc::Hash), 1);
    assert_eq!(tpm.command_count(TpmCc::SequenceUpdate), 3);
}

#[test]
fn test_null_hierarchy_has_no_ticket() {
    let mut tpm = SoftTpm::new();
    let config = Config {
        hierarchy: tpm2_session::tpm_rh::NULL,
        ..Config::default()
    };
    let mut ctx = TpmContext::new(&mut tpm, config);
    let output = ctx.hash(b"abc", TpmAlgId::Sha256).unwrap();
    assert_eq!(output.validation, None);
}

#[test]
fn test_hmac_sequence_matches_local_hmac() {
    let mut tpm = SoftTpm::new();
    let handle = tpm.add_hmac_key(b"hmac key", b"keypw");
    let mut ctx = context(&mut tpm);
    let key = ctx.load_object_with_auth(&format!("{handle}"), "str:keypw").unwrap();
    let data = input(3000);
    let expected = crypto::hmac(TpmAlgId::Sha256, b"hmac key", &data).unwrap();

    let source = DigestSource::Hmac {
        key: &key,
        hash_alg: TpmAlgId::Null,
    };
    assert_eq!(ctx.digest_slice(source, &data).unwrap().digest, expected);
    assert_eq!(
        ctx.hmac_input(&key, &mut &data[..], None).unwrap(),
        expected
    );
    let short = ctx.digest_slice(source, &data[..16]).unwrap();
    assert_eq!(
        short.digest,
        crypto::hmac(TpmAlgId::Sha256, b"hmac key", &data[..16]).unwrap()
    );
    assert_eq!(short.validation, None);
}

#[test]
fn test_hmac_with_wrong_key_password() {
    let mut tpm = SoftTpm::new();
    let handle = tpm.add_hmac_key(b"hmac key", b"keypw");
    let mut ctx = context(&mut tpm);
    let key = LoadedObject::from_handle(handle);
    let err = ctx
        .digest_slice(
            DigestSource::Hmac {
                key: &key,
                hash_alg: TpmAlgId::Sha256,
            },
            &input(2048),
        )
        .unwrap_err();
    assert_eq!(err.response_code().unwrap().kind(), TpmRc::AuthFail);
    assert_eq!(ctx.active_sequence_count(), 0);
}

#[test]
fn test_sequence_lifecycle_errors() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let auth = AuthValue::new(b"seq".to_vec()).unwrap();
    let sequence = ctx.hash_sequence_start(&auth, TpmAlgId::Sha256).unwrap();

    let oversized = input(1025);
    assert!(matches!(
        ctx.sequence_update(sequence, &oversized),
        Err(Error::SequenceState(_))
    ));
    ctx.sequence_update(sequence, b"abc").unwrap();
    ctx.sequence_complete(sequence, b"").unwrap();
    assert!(matches!(
        ctx.sequence_update(sequence, b"more"),
        Err(Error::SequenceState(_))
    ));
    assert!(matches!(
        ctx.sequence_complete(sequence, b""),
        Err(Error::SequenceState(_))
    ));
    ctx.sequence_abort(sequence).unwrap();
    assert_eq!(ctx.active_sequence_count(), 0);
}

#[test]
fn test_abort_flushes_sequence() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let sequence = ctx.hash_sequence_start(&AuthValue::empty(), TpmAlgId::Sha256).unwrap();
    ctx.sequence_update(sequence, b"partial").unwrap();
    ctx.sequence_abort(sequence).unwrap();
    ctx.sequence_abort(sequence).unwrap();
    drop(ctx);
    assert_eq!(tpm.sequence_count(), 0);
    assert_eq!(tpm.command_count(TpmCc::FlushContext), 1);
}

#[test]
fn test_failed_update_retires_sequence() {
    let mut tpm = SoftTpm::new();
    tpm.fail_next(TpmCc::SequenceUpdate, TpmRc::Failure.into());
    let mut ctx = context(&mut tpm);
    let err = ctx
        .digest_slice(DigestSource::Hash(TpmAlgId::Sha256), &input(3000))
        .unwrap_err();
    assert!(matches!(err, Error::Device { command: TpmCc::SequenceUpdate, .. }));
    assert_eq!(ctx.active_sequence_count(), 0);
    drop(ctx);
    assert_eq!(tpm.sequence_count(), 0);
}
