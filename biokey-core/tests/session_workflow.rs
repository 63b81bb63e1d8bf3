//! End-to-end workflows against the simulated security key.
//!
//! These tests drive the public API the way the CLI does: connect, run
//! template and credential operations inside sessions, disconnect.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use biokey_core::transport::mock::DEFAULT_PIN;
use biokey_core::{
    credential_id_base64url, encode_attestation_object, encode_client_data_json, BiokeyError,
    BiometricTemplateRegistry, Challenge, CollectorResponse, ConnectionError, DeviceSelector,
    DeviceSessionManager, MakeCredentialOptions, MockTransport, RelyingParty, RemoveOutcome,
    ScriptedCollector, SimulatedKey, StaticPinCollector, TemplateId, TemplateSelector,
    UserEntity, VerificationRequest,
};
use ciborium::value::Value;
use sha2::{Digest, Sha256};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("biokey_core=debug")
        .with_test_writer()
        .try_init();
}

fn static_manager(key: &SimulatedKey) -> DeviceSessionManager<StaticPinCollector> {
    init_tracing();
    let collector = StaticPinCollector::new(Some(DEFAULT_PIN.into()));
    DeviceSessionManager::new(MockTransport::single(key.clone()), collector)
}

fn demo_key() -> SimulatedKey {
    SimulatedKey::bio(12345678)
        .with_template(0x0001, "RightIndex")
        .with_template(0x0002, "LeftThumb")
}

#[test]
fn test_one_session_across_reconnects() {
    init_tracing();
    let first = SimulatedKey::bio(1);
    let second = SimulatedKey::bio(2);
    let collector = ScriptedCollector::new(vec![CollectorResponse::Pin(DEFAULT_PIN.into()); 3]);
    let mut manager = DeviceSessionManager::new(
        MockTransport::new([first.clone(), second.clone()]),
        collector,
    );

    for serial in [1, 2, 1] {
        manager.connect(DeviceSelector::Serial(serial)).unwrap();
        manager.open_session().unwrap();
        manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enumerate())
            .unwrap();
        assert!(manager.has_cached_secret());
        assert_eq!(first.open_connections() + second.open_connections(), 1);
        manager.disconnect();
        assert!(!manager.has_cached_secret());
        assert!(!manager.has_open_session());
    }

    // Connecting while a session is open tears it down first.
    manager.connect(DeviceSelector::Serial(1)).unwrap();
    manager.open_session().unwrap();
    manager.connect(DeviceSelector::Serial(2)).unwrap();
    assert_eq!(first.open_connections(), 0);

    assert_eq!(first.max_open_connections(), 1);
    assert_eq!(second.max_open_connections(), 1);
}

#[test]
fn test_pin_is_never_reused_across_devices() {
    init_tracing();
    let first = SimulatedKey::bio(1);
    let second = SimulatedKey::bio(2).with_pin(Some("654321"));
    let collector = ScriptedCollector::new([
        CollectorResponse::Pin(DEFAULT_PIN.into()),
        CollectorResponse::Pin("654321".into()),
    ]);
    let mut manager =
        DeviceSessionManager::new(MockTransport::new([first, second.clone()]), collector);

    manager.connect(DeviceSelector::Serial(1)).unwrap();
    manager
        .with_session(|s| BiometricTemplateRegistry::new(s).enumerate())
        .unwrap();
    manager.connect(DeviceSelector::Serial(2)).unwrap();
    manager
        .with_session(|s| BiometricTemplateRegistry::new(s).enumerate())
        .unwrap();

    // The second key never saw the first key's PIN.
    assert_eq!(second.pin_retries(), 8);
    assert_eq!(manager.collector().requests().len(), 2);
}

#[test]
fn test_resolve_is_idempotent() {
    let key = demo_key();
    let mut manager = static_manager(&key);

    let (by_id, by_name, listed) = manager
        .with_session(|s| {
            let mut registry = BiometricTemplateRegistry::new(s);
            let by_id = registry.resolve(&TemplateSelector::ById(TemplateId::parse("0002")?))?;
            let by_name = registry.resolve(&TemplateSelector::ByName("rightindex".into()))?;
            Ok((by_id, by_name, registry.enumerate()?))
        })
        .unwrap();

    assert_eq!(by_id.friendly_name, "LeftThumb");
    assert_eq!(by_name.id.to_hex(), "0001");
    assert!(listed.contains(&by_id));
    assert!(listed.contains(&by_name));
}

#[test]
fn test_rename_then_resolve_by_new_name() {
    let key = demo_key();
    let mut manager = static_manager(&key);

    let selector = TemplateSelector::from_parts(None, Some("0001")).unwrap();
    let original = manager
        .with_session(|s| BiometricTemplateRegistry::new(s).resolve(&selector))
        .unwrap();
    manager
        .with_session(|s| BiometricTemplateRegistry::new(s).rename(&original, "Alice"))
        .unwrap();
    let found = manager
        .with_session(|s| {
            BiometricTemplateRegistry::new(s).resolve(&TemplateSelector::ByName("Alice".into()))
        })
        .unwrap();
    assert_eq!(found.id, original.id);
}

#[test]
fn test_remove_then_enumerate() {
    let key = demo_key();
    let mut manager = static_manager(&key);

    let remaining = manager
        .with_session(|s| {
            let mut registry = BiometricTemplateRegistry::new(s);
            let target = registry.resolve(&TemplateSelector::ByName("LeftThumb".into()))?;
            assert_eq!(registry.remove(&target, true)?, RemoveOutcome::Removed);
            registry.enumerate()
        })
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.iter().all(|t| t.id.to_hex() != "0002"));
}

#[test]
fn test_missing_template_is_never_removed() {
    let key = demo_key();
    let mut manager = static_manager(&key);

    let err = manager
        .with_session(|s| {
            let mut registry = BiometricTemplateRegistry::new(s);
            let target = registry.resolve(&TemplateSelector::ById(TemplateId::parse("ab12")?))?;
            registry.remove(&target, true)
        })
        .unwrap_err();
    assert!(matches!(err, BiokeyError::NotFound { .. }));
    assert!(err.to_string().contains("id 'ab12'"));
    assert!(!key.commands().contains(&"removeEnrollment"));
    assert_eq!(key.templates().len(), 2);
}

#[test]
fn test_enroll_then_enumerate() {
    let key = SimulatedKey::bio(1);
    let mut manager = static_manager(&key);

    let (enrolled, listed) = manager
        .with_session(|s| {
            let mut registry = BiometricTemplateRegistry::new(s);
            let enrolled = registry.enroll("LeftThumb")?;
            Ok((enrolled, registry.enumerate()?))
        })
        .unwrap();
    assert!(listed
        .iter()
        .any(|t| t.id == enrolled.id && t.friendly_name == "LeftThumb"));
}

#[test]
fn test_enumerate_empty_sensor() {
    let key = SimulatedKey::bio(1);
    let mut manager = static_manager(&key);
    let listed = manager
        .with_session(|s| BiometricTemplateRegistry::new(s).enumerate())
        .unwrap();
    assert!(listed.is_empty());
}

#[test]
fn test_unknown_serial() {
    let key = SimulatedKey::bio(1);
    let mut manager = static_manager(&key);
    let err = manager.connect(DeviceSelector::Serial(99999)).unwrap_err();
    assert!(matches!(
        err,
        BiokeyError::Connection(ConnectionError::SerialNotFound { serial: 99999 })
    ));
    assert!(err.to_string().contains("99999"));
}

#[test]
fn test_failed_operation_keeps_device_connected() {
    let key = demo_key().rejecting_removal();
    let mut manager = static_manager(&key);
    let device = manager.connect(DeviceSelector::Auto).unwrap();

    let err = manager
        .with_session(|s| {
            let mut registry = BiometricTemplateRegistry::new(s);
            let target = registry.resolve(&TemplateSelector::ByName("LeftThumb".into()))?;
            registry.remove(&target, true)
        })
        .unwrap_err();
    assert!(matches!(err, BiokeyError::DeviceRejected { .. }));
    assert_eq!(manager.active_device(), Some(&device));
    assert!(manager.has_cached_secret());
}

#[test]
fn test_wrong_pin_surfaces_device_retry_count() {
    init_tracing();
    let key = demo_key();
    let collector = ScriptedCollector::new([
        CollectorResponse::Pin("000000".into()),
        CollectorResponse::Pin("111111".into()),
        CollectorResponse::Cancel,
    ]);
    let mut manager = DeviceSessionManager::new(MockTransport::single(key.clone()), collector);

    let err = manager
        .with_session(|s| BiometricTemplateRegistry::new(s).enumerate())
        .unwrap_err();
    assert!(matches!(err, BiokeyError::Cancelled));

    let retries: Vec<_> = manager
        .collector()
        .requests()
        .iter()
        .map(|r| match r {
            VerificationRequest::Pin {
                retries_remaining, ..
            } => *retries_remaining,
            other => panic!("unexpected prompt {other:?}"),
        })
        .collect();
    assert_eq!(retries, [Some(8), Some(7), Some(6)]);
    assert_eq!(key.pin_retries(), 6);
}

#[test]
fn test_make_credential_produces_verifiable_artifacts() {
    let key = SimulatedKey::bio(1);
    let mut manager = static_manager(&key);
    let rp = RelyingParty::new("example.com").with_name("Example");
    let user = UserEntity::new(b"user-1".to_vec(), "alice").with_display_name("Alice");
    let challenge = Challenge::from_relying_party(&rp.id);

    let attestation = manager
        .with_session(|s| {
            s.make_credential(
                &rp,
                &user,
                &challenge,
                &MakeCredentialOptions {
                    resident_key: true,
                    origin: None,
                },
            )
        })
        .unwrap();

    // Client data carries the challenge and the default origin.
    let client_data: serde_json::Value =
        serde_json::from_str(attestation.client_data_json()).unwrap();
    assert_eq!(client_data["type"], "webauthn.create");
    assert_eq!(client_data["challenge"], challenge.to_base64url());
    assert_eq!(client_data["origin"], "https://example.com");
    assert_eq!(
        STANDARD.decode(encode_client_data_json(&attestation)).unwrap(),
        attestation.client_data_json().as_bytes()
    );

    // authData is bound to the relying party and carries the credential id.
    let object = STANDARD
        .decode(encode_attestation_object(&attestation).unwrap())
        .unwrap();
    let Value::Map(entries) = ciborium::from_reader::<Value, _>(object.as_slice()).unwrap() else {
        panic!("attestation object is not a map");
    };
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].1, Value::Text("packed".into()));
    let Value::Bytes(auth_data) = &entries[2].1 else {
        panic!("authData is not a byte string");
    };
    assert_eq!(&auth_data[..32], Sha256::digest(b"example.com").as_slice());

    let credential_id = URL_SAFE_NO_PAD
        .decode(credential_id_base64url(&attestation))
        .unwrap();
    assert_eq!(credential_id, attestation.raw().credential_id());
    assert!(auth_data
        .windows(credential_id.len())
        .any(|w| w == credential_id.as_slice()));
}

#[test]
fn test_make_credential_cancelled_at_touch() {
    init_tracing();
    let key = SimulatedKey::new(1);
    let collector = ScriptedCollector::new([CollectorResponse::Cancel]);
    let mut manager = DeviceSessionManager::new(MockTransport::single(key.clone()), collector);

    let err = manager
        .with_session(|s| {
            s.make_credential(
                &RelyingParty::new("example.com"),
                &UserEntity::new(vec![1], "bob"),
                &Challenge::from_bytes(vec![0; 32]),
                &MakeCredentialOptions::default(),
            )
        })
        .unwrap_err();
    assert!(matches!(err, BiokeyError::Cancelled));
    assert_eq!(
        manager.collector().requests(),
        &[VerificationRequest::Touch]
    );
    assert!(!key.commands().contains(&"makeCredential"));
}
