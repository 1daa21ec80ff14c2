//! Auto-encrypting command interceptor.
//!
//! [`CommandTransport`] is the seam to the database driver: anything able to
//! run a command document against a database. [`AutoEncryptingClient`] wraps
//! one, encrypting outgoing commands for namespaces with an encryption
//! schema and decrypting every reply, continuation batches included.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::engine::CryptEngine;
use crate::error::{Error, ServerError};
use crate::marking::is_marked_command;
use crate::options::{AutoEncryptionOpts, Namespace};

/// Runs database commands.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Runs `command` against database `db` and returns the raw reply.
    ///
    /// # Errors
    ///
    /// Returns error if the command cannot be delivered. Error replies
    /// (`ok: 0`) are returned as documents; see [`check_reply`].
    async fn run_command(&self, db: &str, command: Document) -> Result<Document, Error>;
}

#[async_trait]
impl<T: CommandTransport + ?Sized> CommandTransport for Arc<T> {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document, Error> {
        (**self).run_command(db, command).await
    }
}

/// Turns an error reply into an `Error::Server`.
///
/// A reply fails if `ok` is not 1 or if it carries `writeErrors`.
///
/// # Errors
///
/// Returns `Error::Server` with the reply's code and message.
pub fn check_reply(reply: Document) -> Result<Document, Error> {
    if !is_ok(reply.get("ok")) {
        return Err(server_error(&reply).into());
    }

    let first_write_error = reply
        .get_array("writeErrors")
        .ok()
        .and_then(|errors| errors.first())
        .and_then(Bson::as_document);
    if let Some(write_error) = first_write_error {
        return Err(server_error(write_error).into());
    }

    Ok(reply)
}

fn is_ok(value: Option<&Bson>) -> bool {
    match value {
        Some(Bson::Int32(ok)) => *ok == 1,
        Some(Bson::Int64(ok)) => *ok == 1,
        Some(Bson::Double(ok)) => (*ok - 1.0).abs() < f64::EPSILON,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

fn server_error(reply: &Document) -> ServerError {
    let code = match reply.get("code") {
        Some(Bson::Int32(code)) => *code,
        Some(Bson::Int64(code)) => i32::try_from(*code).unwrap_or_default(),
        _ => 0,
    };
    let message = reply.get_str("errmsg").unwrap_or("command failed");
    ServerError::new(code, message)
}

/// Returns the namespace a command targets if it is one that gets marked.
#[must_use]
pub fn command_namespace(db: &str, command: &Document) -> Option<Namespace> {
    let (name, target) = command.iter().next()?;
    if !is_marked_command(name) {
        return None;
    }
    match target {
        Bson::String(coll) => Some(Namespace::new(db, coll.as_str())),
        _ => None,
    }
}

/// Command transport applying automatic encryption and decryption.
///
/// Key vault reads never pass through the encrypting path: they use the
/// configured key vault client or the raw inner transport.
pub struct AutoEncryptingClient<T> {
    raw: Arc<T>,
    engine: Arc<CryptEngine>,
    bypass_auto_encryption: bool,
}

impl<T: CommandTransport + 'static> AutoEncryptingClient<T> {
    /// Wraps `transport`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the options are invalid.
    pub fn new(transport: T, opts: &AutoEncryptionOpts) -> Result<Self, Error> {
        let raw = Arc::new(transport);
        let engine = CryptEngine::from_opts(opts, Arc::clone(&raw) as Arc<dyn CommandTransport>)?;
        tracing::debug!(
            key_vault = %opts.key_vault_namespace(),
            bypass = opts.bypass_auto_encryption(),
            "auto encryption enabled"
        );
        Ok(Self {
            raw,
            engine: Arc::new(engine),
            bypass_auto_encryption: opts.bypass_auto_encryption(),
        })
    }

    /// Returns the inner transport, which sends commands unmodified.
    #[must_use]
    pub const fn raw(&self) -> &Arc<T> {
        &self.raw
    }

    /// Returns the engine shared with explicit encryption.
    #[must_use]
    pub const fn engine(&self) -> &Arc<CryptEngine> {
        &self.engine
    }
}

#[async_trait]
impl<T: CommandTransport + 'static> CommandTransport for AutoEncryptingClient<T> {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document, Error> {
        let command = match command_namespace(db, &command) {
            Some(namespace) if !self.bypass_auto_encryption => {
                self.engine.encrypt_command(namespace, command).await?
            }
            _ => command,
        };

        let reply = self.raw.run_command(db, command).await?;
        self.engine.decrypt_document(reply).await
    }
}

impl<T> std::fmt::Debug for AutoEncryptingClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoEncryptingClient")
            .field("engine", &self.engine)
            .field("bypass_auto_encryption", &self.bypass_auto_encryption)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsProviders;
    use bson::doc;
    use parking_lot::Mutex;

    /// Records every command and replies `{ok: 1}`.
    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<Document>>,
    }

    #[async_trait]
    impl CommandTransport for Recorder {
        async fn run_command(&self, _db: &str, command: Document) -> Result<Document, Error> {
            self.commands.lock().push(command);
            Ok(doc! { "ok": 1 })
        }
    }

    fn command_names(recorder: &Recorder) -> Vec<String> {
        recorder.commands.lock().iter().filter_map(|c| c.keys().next().cloned()).collect()
    }

    #[test]
    fn test_check_reply() {
        assert!(check_reply(doc! { "ok": 1 }).is_ok());
        assert!(check_reply(doc! { "ok": 1.0 }).is_ok());

        let err = check_reply(doc! { "ok": 0, "code": 18, "errmsg": "auth failed" }).unwrap_err();
        assert!(matches!(err, Error::Server(ref e) if e.is_authentication_failure()));

        let err = check_reply(doc! {
            "ok": 1,
            "n": 0,
            "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "duplicate key" } ],
        })
        .unwrap_err();
        assert!(matches!(err, Error::Server(ref e) if e.code == 11000));

        assert!(check_reply(doc! {}).is_err());
    }

    #[test]
    fn test_command_namespace() {
        let ns = command_namespace("db", &doc! { "find": "coll", "filter": {} }).unwrap();
        assert_eq!(ns.to_string(), "db.coll");
        for name in ["findAndModify", "findandmodify"] {
            let mut command = Document::new();
            command.insert(name, "coll");
            assert!(command_namespace("db", &command).is_some());
        }

        assert!(command_namespace("db", &doc! { "ping": 1 }).is_none());
        assert!(command_namespace("db", &doc! { "getMore": 5_i64, "collection": "coll" }).is_none());
        assert!(command_namespace("db", &doc! { "aggregate": 1, "pipeline": [] }).is_none());
    }

    #[tokio::test]
    async fn test_unmarked_command_is_forwarded() {
        let client = AutoEncryptingClient::new(Recorder::default(), &AutoEncryptionOpts::default()).unwrap();

        let reply = client.run_command("admin", doc! { "ping": 1 }).await.unwrap();
        assert_eq!(reply, doc! { "ok": 1 });
        assert_eq!(command_names(client.raw()), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_schema_lookup_precedes_marked_command() {
        let client = AutoEncryptingClient::new(Recorder::default(), &AutoEncryptionOpts::default()).unwrap();
        let command = doc! { "insert": "coll", "documents": [ { "ssn": "000" } ] };

        client.run_command("db", command.clone()).await.unwrap();
        assert_eq!(command_names(client.raw()), vec!["listCollections", "insert"]);
        assert_eq!(client.raw().commands.lock()[1], command);
    }

    #[tokio::test]
    async fn test_bypass_skips_encryption() {
        let opts = AutoEncryptionOpts::new(KmsProviders::new(), Namespace::new("admin", "datakeys"))
            .with_bypass_auto_encryption(true);
        let client = AutoEncryptingClient::new(Recorder::default(), &opts).unwrap();

        client.run_command("db", doc! { "insert": "coll", "documents": [] }).await.unwrap();
        assert_eq!(command_names(client.raw()), vec!["insert"]);
    }
}
