use std::sync::{Arc, LazyLock};

use base64::Engine;
use chrono::{Duration, Utc};
use proptest::prelude::*;

use crate::{
    certificates::PlatformCertificate,
    crypto::{ApiV3Key, KeyStore, MerchantIdentity, PayloadCipher, Signer, build_message},
    error::WechatPayError,
};

const MERCHANT_KEY: &str = include_str!("../../../tests/fixtures/merchant_key.pem");

static SIGNER: LazyLock<Signer> = LazyLock::new(|| {
    let identity = MerchantIdentity::new("1230000109", "wx888", "444F4864EA9B34415").unwrap();
    Signer::new(Arc::new(KeyStore::from_pem(identity, MERCHANT_KEY).unwrap()))
});

fn merchant_certificate() -> PlatformCertificate {
    PlatformCertificate::from_public_key(
        "444F4864EA9B34415",
        SIGNER.keys().public_key(),
        Utc::now() - Duration::days(1),
        Utc::now() + Duration::days(1),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_sign_verify_roundtrip(fields in prop::collection::vec("[ -~]{0,40}", 1..6)) {
        let signature = SIGNER.sign(&fields).unwrap();
        let message = build_message(&fields);

        prop_assert!(merchant_certificate().verify(message.as_bytes(), &signature).is_ok());
    }

    #[test]
    fn test_signature_bit_flip_rejected(
        fields in prop::collection::vec("[a-zA-Z0-9=_]{1,32}", 4),
        byte in 0usize..256,
        bit in 0u8..8,
    ) {
        let mut signature = SIGNER.sign(&fields).unwrap();
        signature[byte] ^= 1 << bit;

        let result = merchant_certificate().verify(build_message(&fields).as_bytes(), &signature);
        prop_assert!(matches!(result, Err(WechatPayError::SignatureInvalid(_))));
    }

    #[test]
    fn test_message_bit_flip_rejected(
        body in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut message = b"1554208460\nNONCE\n".to_vec();
        message.extend_from_slice(&body);
        message.push(b'\n');
        let signature = SIGNER.sign_bytes(&message).unwrap();

        let i = index.index(message.len());
        message[i] ^= 1 << bit;
        prop_assert!(merchant_certificate().verify(&message, &signature).is_err());
    }

    #[test]
    fn test_build_message_shape(fields in prop::collection::vec("[^\n]{0,20}", 0..8)) {
        let message = build_message(&fields);
        prop_assert!(message.ends_with('\n'));
        prop_assert_eq!(message.matches('\n').count(), fields.len().max(1));
    }

    #[test]
    fn test_cipher_roundtrip(
        key in "[a-zA-Z0-9]{32}",
        aad in "[a-z_]{0,16}",
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let cipher = PayloadCipher::new(&ApiV3Key::from_text(&key).unwrap());
        let block = cipher.encrypt(aad.as_bytes(), &plaintext).unwrap();

        prop_assert_eq!(cipher.decrypt_block(&block).unwrap(), plaintext);
    }

    #[test]
    fn test_ciphertext_bit_flip_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let cipher = PayloadCipher::new(&ApiV3Key::from_text("0123456789abcdef0123456789abcdef").unwrap());
        let block = cipher.encrypt_with_nonce("abcdefghijkl", b"certificate", &plaintext).unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(&block.ciphertext).unwrap();

        let i = index.index(raw.len());
        raw[i] ^= 1 << bit;

        let result = cipher.decrypt(b"abcdefghijkl", b"certificate", &raw);
        prop_assert!(matches!(result, Err(WechatPayError::Authentication(_))));
    }
}
