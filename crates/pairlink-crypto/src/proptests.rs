#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::kdf::{derive_key, LABEL_AUTH, LABEL_SIGNALING};
    use crate::message_crypto::MessageCrypto;
    use crate::replay::NonceCache;

    proptest! {
        #[test]
        fn prop_labels_never_collide(secret in any::<[u8; 32]>()) {
            let auth = derive_key(&secret, LABEL_AUTH).unwrap();
            let signaling = derive_key(&secret, LABEL_SIGNALING).unwrap();
            prop_assert_ne!(auth.as_bytes(), signaling.as_bytes());
            let auth_again = derive_key(&secret, LABEL_AUTH).unwrap();
            prop_assert_eq!(auth_again.as_bytes(), auth.as_bytes());
        }

        #[test]
        fn prop_aead_round_trip(
            secret in any::<[u8; 32]>(),
            msg in prop::collection::vec(any::<u8>(), 0..2048)
        ) {
            let crypto = MessageCrypto::new(&derive_key(&secret, LABEL_SIGNALING).unwrap());
            let blob = crypto.encrypt(&msg).unwrap();
            prop_assert_eq!(crypto.decrypt(&blob).unwrap(), msg);
        }

        #[test]
        fn prop_any_single_bit_flip_fails(
            msg in prop::collection::vec(any::<u8>(), 0..256),
            pos in any::<prop::sample::Index>(),
            bit in 0u8..8
        ) {
            let crypto = MessageCrypto::new(&derive_key(&[0x42; 32], LABEL_SIGNALING).unwrap());
            let mut blob = crypto.encrypt(&msg).unwrap();
            let i = pos.index(blob.len());
            blob[i] ^= 1 << bit;
            prop_assert!(crypto.decrypt(&blob).is_err());
        }

        #[test]
        fn prop_cache_never_exceeds_capacity(
            nonces in prop::collection::vec(any::<[u8; 16]>(), 0..400),
            capacity in 1usize..150
        ) {
            let mut cache = NonceCache::new(capacity);
            for n in &nonces {
                let _ = cache.check_and_insert(n);
                prop_assert!(cache.len() <= capacity);
            }
        }
    }
}
