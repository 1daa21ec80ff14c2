//! Corpus tests: every value type under both algorithms.

mod common;

use std::sync::Arc;

use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, DateTime, Decimal128, JavaScriptCodeWithScope, Regex, Timestamp};
use common::{local_kms, MemoryDatabase};
use fieldcrypt::prelude::*;
use proptest::prelude::*;

/// Values encryptable with both algorithms.
fn deterministic_corpus() -> Vec<Bson> {
    vec![
        Bson::String("hello".into()),
        Bson::String(String::new()),
        Bson::Int32(-7),
        Bson::Int64(1 << 40),
        Bson::ObjectId(ObjectId::from_bytes([3; 12])),
        Bson::DateTime(DateTime::from_millis(1_700_000_000_000)),
        Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![0, 1, 2] }),
        Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: vec![9; 16] }),
        Bson::RegularExpression(Regex { pattern: "^a.*".into(), options: "i".into() }),
        Bson::JavaScriptCode("function() {}".into()),
        Bson::Timestamp(Timestamp { time: 1, increment: 2 }),
    ]
}

/// Values only the random algorithm accepts.
fn random_only_corpus() -> Vec<Bson> {
    vec![
        Bson::Double(1.5),
        Bson::Decimal128(Decimal128::from_bytes([1; 16])),
        Bson::Boolean(true),
        Bson::Document(doc! { "a": 1, "b": [1, 2] }),
        Bson::Array(vec![Bson::Int32(1), Bson::String("x".into())]),
        Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
            code: "function() { return x; }".into(),
            scope: doc! { "x": 1 },
        }),
    ]
}

/// Values no algorithm accepts.
fn forbidden_corpus() -> Vec<Bson> {
    vec![Bson::Null, Bson::Undefined, Bson::MinKey, Bson::MaxKey, Bson::Symbol("s".into())]
}

async fn encryption_with_key() -> (ClientEncryption, bson::Uuid) {
    let db = MemoryDatabase::new();
    let encryption = ClientEncryption::new(
        Arc::clone(&db) as Arc<dyn CommandTransport>,
        Namespace::new("admin", "datakeys"),
        local_kms(),
    );
    let id = encryption.create_data_key("local", None, vec!["corpus".to_string()]).await.unwrap();
    (encryption, id)
}

#[tokio::test]
async fn test_corpus_round_trips() {
    let (encryption, id) = encryption_with_key().await;

    for value in deterministic_corpus() {
        for algorithm in [Algorithm::Deterministic, Algorithm::Random] {
            let encrypted = encryption
                .encrypt(value.clone(), algorithm, EncryptKey::Id(id))
                .await
                .unwrap_or_else(|e| panic!("{algorithm} encryption of {value} failed: {e}"));
            let decrypted = encryption.decrypt(&Bson::Binary(encrypted)).await.unwrap();
            assert_eq!(decrypted, value);
        }
    }

    for value in random_only_corpus() {
        let encrypted = encryption.encrypt(value.clone(), Algorithm::Random, EncryptKey::Id(id)).await.unwrap();
        assert_eq!(encryption.decrypt(&Bson::Binary(encrypted)).await.unwrap(), value);
    }
}

#[tokio::test]
async fn test_corpus_rejections() {
    let (encryption, id) = encryption_with_key().await;

    for value in random_only_corpus() {
        let err = encryption.encrypt(value, Algorithm::Deterministic, EncryptKey::Id(id)).await.unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    for value in forbidden_corpus() {
        for algorithm in [Algorithm::Deterministic, Algorithm::Random] {
            let err = encryption.encrypt(value.clone(), algorithm, EncryptKey::Id(id)).await.unwrap_err();
            assert!(matches!(err, Error::Encoding(_)), "{value} should not encrypt");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_deterministic_by_id_and_alt_name(text in ".{0,64}", number in any::<i64>()) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (encryption, id) = encryption_with_key().await;
            for value in [Bson::String(text.clone()), Bson::Int64(number)] {
                let by_id = encryption
                    .encrypt(value.clone(), Algorithm::Deterministic, EncryptKey::Id(id))
                    .await
                    .unwrap();
                let by_name = encryption
                    .encrypt(value.clone(), Algorithm::Deterministic, EncryptKey::AltName("corpus".into()))
                    .await
                    .unwrap();
                let random = encryption.encrypt(value.clone(), Algorithm::Random, EncryptKey::Id(id)).await.unwrap();

                assert_eq!(by_id, by_name);
                assert_ne!(by_id, random);
                assert_eq!(encryption.decrypt(&Bson::Binary(random)).await.unwrap(), value);
            }
        });
    }
}
