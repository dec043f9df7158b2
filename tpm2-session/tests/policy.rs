// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy assertions and auth descriptors against the software TPM

use tpm2_session::{
    crypto, tpm_rh, AuthValue, Config, Error, LoadedObject, PolicyDigest, PolicySecretParams,
    PolicyState, PolicyStep, SoftTpm, TpmAlgId, TpmCc, TpmContext, TpmRc, TpmSe, TpmaLocality,
    TpmlPcrSelection,
};

fn context(tpm: &mut SoftTpm) -> TpmContext<&mut SoftTpm> {
    TpmContext::new(tpm, Config::default())
}

fn policy_update(digest: &[u8], code: TpmCc, arg2: &[u8], arg3: &[u8]) -> Vec<u8> {
    let cc = code.to_u32().to_be_bytes();
    let digest = crypto::digest(TpmAlgId::Sha256, &[digest, &cc, arg2]).unwrap();
    crypto::digest(TpmAlgId::Sha256, &[&digest, arg3]).unwrap()
}

#[test]
fn test_trial_digests_match_reference_values() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let zeros = [0u8; 32];

    let password = ctx
        .trial_policy_digest(TpmAlgId::Sha256, &[PolicyStep::Password])
        .unwrap();
    let cc = TpmCc::PolicyAuthValue.to_u32().to_be_bytes();
    assert_eq!(
        password.as_bytes(),
        crypto::digest(TpmAlgId::Sha256, &[&zeros, &cc]).unwrap()
    );
    // PolicyPassword and PolicyAuthValue leave the same digest.
    let auth_value = ctx
        .trial_policy_digest(TpmAlgId::Sha256, &[PolicyStep::AuthValue])
        .unwrap();
    assert_eq!(password, auth_value);

    let endorsement = LoadedObject::from_handle(tpm_rh::ENDORSEMENT);
    let secret = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::Secret {
                auth_object: &endorsement,
                params: PolicySecretParams::default(),
            }],
        )
        .unwrap();
    assert_eq!(
        secret.as_bytes(),
        policy_update(
            &zeros,
            TpmCc::PolicySecret,
            &tpm_rh::ENDORSEMENT.to_be_bytes(),
            &[]
        )
    );
    // The well-known EK policy
    assert_eq!(
        secret.to_string(),
        "837197674484b3f81a90cc8d46a5d724fd52d76e06520b64f2a1da1b331469aa"
    );

    let code = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::CommandCode(TpmCc::Hmac.to_u32())],
        )
        .unwrap();
    let cc = TpmCc::PolicyCommandCode.to_u32().to_be_bytes();
    let arg = TpmCc::Hmac.to_u32().to_be_bytes();
    assert_eq!(
        code.as_bytes(),
        crypto::digest(TpmAlgId::Sha256, &[&zeros, &cc, &arg]).unwrap()
    );

    let locality = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::Locality(TpmaLocality(TpmaLocality::ZERO))],
        )
        .unwrap();
    let cc = TpmCc::PolicyLocality.to_u32().to_be_bytes();
    assert_eq!(
        locality.as_bytes(),
        crypto::digest(TpmAlgId::Sha256, &[&zeros, &cc, &[TpmaLocality::ZERO]]).unwrap()
    );
    assert_eq!(ctx.open_session_count(), 0);
}

#[test]
fn test_policy_or_and_restart() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let branch_a = ctx
        .trial_policy_digest(TpmAlgId::Sha256, &[PolicyStep::Password])
        .unwrap();
    let branch_b = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::CommandCode(TpmCc::Certify.to_u32())],
        )
        .unwrap();
    let branches = vec![branch_a.clone(), branch_b.clone()];
    let expected = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::Password, PolicyStep::Or(branches.clone())],
        )
        .unwrap();

    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();
    // A fresh digest matches neither branch.
    let err = ctx.policy_or(session, &branches).unwrap_err();
    match err {
        Error::PolicyStepRejected { command, rc } => {
            assert_eq!(command, TpmCc::PolicyOr);
            assert_eq!(rc.kind(), TpmRc::Value);
        }
        other => panic!("unexpected error {other:?}"),
    }

    ctx.policy_restart(session).unwrap();
    assert_eq!(ctx.policy_state(session).unwrap(), PolicyState::Fresh);
    assert_eq!(
        ctx.policy_get_digest(session).unwrap(),
        PolicyDigest::fresh(TpmAlgId::Sha256)
    );

    ctx.run_policy(session, &[PolicyStep::Password, PolicyStep::Or(branches)])
        .unwrap();
    assert_eq!(ctx.policy_state(session).unwrap(), PolicyState::Building);
    assert_eq!(ctx.policy_get_digest(session).unwrap(), expected);
}

#[test]
fn test_policy_session_authorizes_once() {
    let mut tpm = SoftTpm::new();
    let key = tpm.add_hmac_key(b"key", b"pw");
    let mut ctx = context(&mut tpm);
    let policy = ctx
        .trial_policy_digest(TpmAlgId::Sha256, &[PolicyStep::Password])
        .unwrap();
    ctx.transport_mut().set_auth_policy(key, policy.as_bytes());

    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();
    let object = LoadedObject::from_handle(key)
        .with_auth(AuthValue::new(b"pw".to_vec()).unwrap())
        .with_session(session);

    ctx.policy_password(session).unwrap();
    ctx.hmac(&object, b"data", TpmAlgId::Null).unwrap();
    assert_eq!(ctx.policy_state(session).unwrap(), PolicyState::Fresh);

    let err = ctx.hmac(&object, b"data", TpmAlgId::Null).unwrap_err();
    assert_eq!(err.response_code().unwrap().kind(), TpmRc::PolicyFail);

    ctx.policy_password(session).unwrap();
    ctx.hmac(&object, b"data", TpmAlgId::Null).unwrap();
}

#[test]
fn test_policy_auth_value_sends_auth() {
    let mut tpm = SoftTpm::new();
    let key = tpm.add_hmac_key(b"key", b"pw");
    let mut ctx = context(&mut tpm);
    let policy = ctx
        .trial_policy_digest(TpmAlgId::Sha256, &[PolicyStep::AuthValue])
        .unwrap();
    ctx.transport_mut().set_auth_policy(key, policy.as_bytes());

    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();
    let object = LoadedObject::from_handle(key)
        .with_auth(AuthValue::new(b"pw".to_vec()).unwrap())
        .with_session(session);
    ctx.policy_auth_value(session).unwrap();
    let mac = ctx.hmac(&object, b"data", TpmAlgId::Null).unwrap();
    assert_eq!(
        mac.digest,
        crypto::hmac(TpmAlgId::Sha256, b"key", b"data").unwrap()
    );

    let wrong = LoadedObject::from_handle(key)
        .with_auth(AuthValue::new(b"nope".to_vec()).unwrap())
        .with_session(session);
    ctx.policy_auth_value(session).unwrap();
    let err = ctx.hmac(&wrong, b"data", TpmAlgId::Null).unwrap_err();
    assert_eq!(err.response_code().unwrap().kind(), TpmRc::AuthFail);
}

#[test]
fn test_policy_secret() {
    let mut tpm = SoftTpm::new();
    tpm.set_hierarchy_auth(tpm_rh::ENDORSEMENT, b"endorse");
    let mut ctx = context(&mut tpm);
    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();

    let wrong = LoadedObject::from_handle(tpm_rh::ENDORSEMENT)
        .with_auth(AuthValue::new(b"guess".to_vec()).unwrap());
    let err = ctx
        .policy_secret(&wrong, session, &PolicySecretParams::default())
        .unwrap_err();
    assert!(matches!(err, Error::PolicyStepRejected { .. }));
    assert_eq!(err.response_code().unwrap().kind(), TpmRc::AuthFail);
    assert_eq!(ctx.policy_state(session).unwrap(), PolicyState::Fresh);

    let endorsement = LoadedObject::from_handle(tpm_rh::ENDORSEMENT)
        .with_auth(AuthValue::new(b"endorse".to_vec()).unwrap());
    let nonce = ctx.nonce_tpm(session).unwrap().to_vec();
    let output = ctx
        .policy_secret(
            &endorsement,
            session,
            &PolicySecretParams {
                nonce_tpm: nonce,
                expiration: -60,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!output.ticket.is_null());
    assert!(output.timeout.is_empty());
}

#[test]
fn test_policy_secret_self_authorization() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();
    let object = LoadedObject::from_handle(tpm_rh::OWNER).with_session(session);
    let before = tpm_commands(&ctx);
    assert!(matches!(
        ctx.policy_secret(&object, session, &PolicySecretParams::default()),
        Err(Error::ShandleConflict(_))
    ));
    assert_eq!(tpm_commands(&ctx), before);
}

fn tpm_commands(ctx: &TpmContext<&mut SoftTpm>) -> usize {
    ctx.transport().commands().len()
}

#[test]
fn test_policy_authorize() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let approved = ctx
        .trial_policy_digest(TpmAlgId::Sha256, &[PolicyStep::Password])
        .unwrap();
    let key_sign = [0x00, 0x0B, 0xAA, 0xBB];
    let ticket = ctx
        .transport()
        .approve_policy(&approved, b"ref", &key_sign)
        .unwrap();

    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();
    ctx.policy_password(session).unwrap();
    ctx.policy_authorize(session, &approved, b"ref", &key_sign, &ticket)
        .unwrap();
    assert_eq!(
        ctx.policy_get_digest(session).unwrap().as_bytes(),
        policy_update(&[0u8; 32], TpmCc::PolicyAuthorize, &key_sign, b"ref")
    );

    ctx.policy_restart(session).unwrap();
    ctx.policy_password(session).unwrap();
    let err = ctx
        .policy_authorize(session, &approved, b"other", &key_sign, &ticket)
        .unwrap_err();
    assert_eq!(err.response_code().unwrap().kind(), TpmRc::Ticket);
}

#[test]
fn test_oversized_policy_arguments_are_not_sent() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let approved = PolicyDigest(vec![0u8; 32]);
    let ticket = ctx
        .transport()
        .approve_policy(&approved, b"", &[0x00, 0x0B])
        .unwrap();
    let session = ctx.start_session(TpmSe::Policy, TpmAlgId::Sha256).unwrap();
    let before = tpm_commands(&ctx);

    let long_ref = vec![0x5A; u16::MAX as usize + 1];
    assert!(matches!(
        ctx.policy_authorize(session, &approved, &long_ref, &[0x00, 0x0B], &ticket),
        Err(Error::Marshal(_))
    ));
    assert!(matches!(
        ctx.policy_duplication_select(session, &[0u8; 67], &[0x00, 0x0B], false),
        Err(Error::Marshal(_))
    ));
    assert!(matches!(
        ctx.policy_pcr(session, &[0u8; 65], &TpmlPcrSelection::default()),
        Err(Error::Marshal(_))
    ));
    assert_eq!(tpm_commands(&ctx), before);
    assert_eq!(ctx.policy_state(session).unwrap(), PolicyState::Fresh);
}

#[test]
fn test_duplication_select_digest() {
    let mut tpm = SoftTpm::new();
    let mut ctx = context(&mut tpm);
    let object = [0x00, 0x0B, 1, 2, 3];
    let parent = [0x00, 0x0B, 4, 5, 6];
    let digest = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::DuplicationSelect {
                object_name: object.to_vec(),
                new_parent_name: parent.to_vec(),
                include_object: false,
            }],
        )
        .unwrap();
    let cc = TpmCc::PolicyDuplicationSelect.to_u32().to_be_bytes();
    assert_eq!(
        digest.as_bytes(),
        crypto::digest(TpmAlgId::Sha256, &[&[0u8; 32], &cc, &parent, &[0]]).unwrap()
    );
}

#[test]
fn test_pcr_descriptor() {
    let mut tpm = SoftTpm::new();
    tpm.extend_pcr(7, b"secure boot").unwrap();
    let key = tpm.add_hmac_key(b"key", b"");
    let mut ctx = context(&mut tpm);

    let policy = ctx
        .trial_policy_digest(
            TpmAlgId::Sha256,
            &[PolicyStep::Pcr {
                pcr_digest: Vec::new(),
                selection: TpmlPcrSelection::single(TpmAlgId::Sha256, &[7]),
            }],
        )
        .unwrap();
    ctx.transport_mut().set_auth_policy(key, policy.as_bytes());

    let object = ctx.load_object_with_auth("0x80000000", "pcr:sha256:7").unwrap();
    let session = object.session.unwrap();
    assert_eq!(ctx.session_type(session).unwrap(), TpmSe::Policy);
    ctx.hmac(&object, b"data", TpmAlgId::Null).unwrap();
    ctx.close_object(object).unwrap();

    // PolicyPCR still passes against the new value, but the digest differs.
    ctx.transport_mut().extend_pcr(7, b"rogue").unwrap();
    let object = ctx.load_object_with_auth("0x80000000", "pcr:sha256:7").unwrap();
    let err = ctx.hmac(&object, b"data", TpmAlgId::Null).unwrap_err();
    assert_eq!(err.response_code().unwrap().kind(), TpmRc::PolicyFail);
    ctx.close_object(object).unwrap();
    assert_eq!(ctx.open_session_count(), 0);
}

#[test]
fn test_pcr_descriptor_with_raw_values() {
    let dir = tempfile::tempdir().unwrap();
    let mut tpm = SoftTpm::new();
    tpm.extend_pcr(0, b"firmware").unwrap();
    let current = tpm.pcr_value(0).unwrap().to_vec();
    let mut ctx = context(&mut tpm);

    let good = dir.path().join("pcr0.bin");
    fs_err::write(&good, &current).unwrap();
    let credential = ctx
        .resolve_auth(&format!("pcr:sha256:0+{}", good.display()))
        .unwrap();
    let session = credential.session().unwrap();
    assert_eq!(ctx.policy_state(session).unwrap(), PolicyState::Building);
    ctx.close_session(session).unwrap();

    // A stale value is rejected by the device and the session is closed.
    let stale = dir.path().join("stale.bin");
    fs_err::write(&stale, [0u8; 32]).unwrap();
    let err = ctx
        .resolve_auth(&format!("pcr:sha256:0+{}", stale.display()))
        .unwrap_err();
    assert!(matches!(err, Error::PolicyStepRejected { .. }));

    let short = dir.path().join("short.bin");
    fs_err::write(&short, [0u8; 20]).unwrap();
    assert!(matches!(
        ctx.resolve_auth(&format!("pcr:sha256:0+{}", short.display())),
        Err(Error::InvalidAuthDescriptor(_))
    ));
    assert_eq!(ctx.open_session_count(), 0);
}

#[test]
fn test_pcr_read_in_batches() {
    let mut tpm = SoftTpm::new();
    for index in 0..12 {
        tpm.extend_pcr(index, &[index as u8]).unwrap();
    }
    let expected: Vec<Vec<u8>> = (0..12).map(|i| tpm.pcr_value(i).unwrap().to_vec()).collect();
    let mut ctx = context(&mut tpm);
    let pcrs: Vec<u32> = (0..12).collect();
    assert_eq!(ctx.pcr_read(TpmAlgId::Sha256, &pcrs).unwrap(), expected);
    drop(ctx);
    assert_eq!(tpm.command_count(TpmCc::PcrRead), 2);
}
