//! Per-operation crypto context.
//!
//! A [`CryptoContext`] is a pure state machine: it never performs I/O. It
//! tells its driver what it needs next (a schema, markings, data keys, key
//! material) and the driver feeds the answers back in:
//!
//! ```text
//! Start -> NeedSchema -> NeedMarkings -> NeedKeys -> NeedKms -> Ready -> Done
//! ```
//!
//! Decryption and explicit operations enter at `NeedKeys`. Any state but
//! `Done` can move to `Error`. Once in `Done` or `Error` the context accepts
//! no further input.

use std::fmt;
use std::sync::Arc;

use bson::{doc, Binary, Bson, Document, Uuid};

use crate::cipher::FieldCipher;
use crate::crypt::KeyRing;
use crate::error::Error;
use crate::key_vault::{DataKey, KeyRef};
use crate::marking::{encrypted_value_keys, placeholder_keys, Placeholder};
use crate::options::Namespace;
use crate::schema::EncryptionSchema;
use crate::value::{Algorithm, EncryptedValue};

/// Field holding the single value of explicit operations.
const VALUE_FIELD: &str = "v";

/// State of a crypto context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, nothing requested yet
    Start,
    /// Waiting for the namespace schema
    NeedSchema,
    /// Waiting for the marked command
    NeedMarkings,
    /// Waiting for data keys from the key vault
    NeedKeys,
    /// Waiting for unwrapped key material
    NeedKms,
    /// Every key is available; waiting for the final document
    Ready,
    /// Finished successfully
    Done,
    /// Failed; the operation must not emit anything
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::NeedSchema => "NEED_SCHEMA",
            Self::NeedMarkings => "NEED_MARKINGS",
            Self::NeedKeys => "NEED_KEYS",
            Self::NeedKms => "NEED_KMS",
            Self::Ready => "READY",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// What a context was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Encrypt the fields of an outgoing command
    AutoEncrypt,
    /// Decrypt every encrypted value of a reply
    AutoDecrypt,
    /// Encrypt one value
    ExplicitEncrypt,
    /// Decrypt one value
    ExplicitDecrypt,
}

impl ContextKind {
    /// Whether the final step encrypts (otherwise it decrypts).
    #[must_use]
    pub const fn encrypts(self) -> bool {
        matches!(self, Self::AutoEncrypt | Self::ExplicitEncrypt)
    }
}

/// State of one encrypt or decrypt operation.
pub struct CryptoContext {
    kind: ContextKind,
    state: State,
    namespace: Option<Namespace>,
    document: Document,
    schema: Option<Arc<EncryptionSchema>>,
    key_requests: Vec<KeyRef>,
    keys: Vec<DataKey>,
    ring: KeyRing,
    result: Option<Document>,
}

impl CryptoContext {
    fn new(kind: ContextKind, namespace: Option<Namespace>, document: Document) -> Self {
        Self {
            kind,
            state: State::Start,
            namespace,
            document,
            schema: None,
            key_requests: Vec::new(),
            keys: Vec::new(),
            ring: KeyRing::new(),
            result: None,
        }
    }

    /// Creates a context encrypting `command` bound for `namespace`.
    #[must_use]
    pub fn auto_encrypt(namespace: Namespace, command: Document) -> Self {
        Self::new(ContextKind::AutoEncrypt, Some(namespace), command)
    }

    /// Creates a context decrypting a reply document.
    #[must_use]
    pub fn auto_decrypt(document: Document) -> Self {
        Self::new(ContextKind::AutoDecrypt, None, document)
    }

    /// Creates a context encrypting a single value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bson` if the value cannot be wrapped.
    pub fn explicit_encrypt(value: Bson, algorithm: Algorithm, key: KeyRef) -> Result<Self, Error> {
        let placeholder = Placeholder { key, algorithm, value }.to_binary()?;
        Ok(Self::new(ContextKind::ExplicitEncrypt, None, doc! { VALUE_FIELD: placeholder }))
    }

    /// Creates a context decrypting a single value.
    #[must_use]
    pub fn explicit_decrypt(value: &EncryptedValue) -> Self {
        Self::new(ContextKind::ExplicitDecrypt, None, doc! { VALUE_FIELD: value.to_binary() })
    }

    /// Returns the kind.
    #[must_use]
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns the namespace whose schema is needed.
    #[must_use]
    pub const fn namespace(&self) -> Option<&Namespace> {
        self.namespace.as_ref()
    }

    /// Returns the document being processed: the original command, the
    /// reply, or the marked command once markings are in.
    #[must_use]
    pub const fn document(&self) -> &Document {
        &self.document
    }

    /// Returns the schema provided for marking.
    #[must_use]
    pub fn schema(&self) -> Option<&EncryptionSchema> {
        self.schema.as_deref()
    }

    /// Returns the keys requested in `NeedKeys`.
    #[must_use]
    pub fn key_requests(&self) -> &[KeyRef] {
        &self.key_requests
    }

    /// Returns the keys whose material is still missing in `NeedKms`.
    #[must_use]
    pub fn kms_requests(&self) -> Vec<&DataKey> {
        self.keys.iter().filter(|key| !self.ring.contains(&key.id())).collect()
    }

    /// Returns the unwrapped keys gathered so far.
    #[must_use]
    pub const fn key_ring(&self) -> &KeyRing {
        &self.ring
    }

    /// Leaves `Start`.
    ///
    /// Auto encryption continues with the schema; everything else goes
    /// straight to key resolution. A decryption with nothing to decrypt is
    /// done immediately.
    ///
    /// # Errors
    ///
    /// Returns error if called in another state or the input is malformed.
    pub fn start(&mut self) -> Result<(), Error> {
        self.expect(State::Start)?;
        match self.kind {
            ContextKind::AutoEncrypt => {
                self.transition(State::NeedSchema);
                Ok(())
            }
            ContextKind::AutoDecrypt | ContextKind::ExplicitDecrypt => {
                let requests = encrypted_value_keys(&self.document);
                self.request_keys(requests);
                Ok(())
            }
            ContextKind::ExplicitEncrypt => {
                let requests = placeholder_keys(&self.document)?;
                self.request_keys(requests);
                Ok(())
            }
        }
    }

    /// Supplies the namespace schema, or `None` if there is none.
    ///
    /// Without a schema, or with one encrypting nothing, the command passes
    /// through unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if called in another state.
    pub fn provide_schema(&mut self, schema: Option<Arc<EncryptionSchema>>) -> Result<(), Error> {
        self.expect(State::NeedSchema)?;
        match schema {
            Some(schema) if schema.has_encrypted_fields() => {
                self.schema = Some(schema);
                self.transition(State::NeedMarkings);
            }
            _ => self.finish(self.document.clone()),
        }
        Ok(())
    }

    /// Supplies the marked command.
    ///
    /// # Errors
    ///
    /// Returns error if called in another state or a placeholder is malformed.
    pub fn provide_markings(&mut self, marked: Document) -> Result<(), Error> {
        self.expect(State::NeedMarkings)?;
        let requests = placeholder_keys(&marked)?;
        self.document = marked;
        self.request_keys(requests);
        Ok(())
    }

    /// Supplies a data key found for one of the requests.
    ///
    /// # Errors
    ///
    /// Returns error if called in another state.
    pub fn provide_key(&mut self, key: DataKey) -> Result<(), Error> {
        self.expect(State::NeedKeys)?;
        if !self.keys.iter().any(|known| known.id() == key.id()) {
            self.keys.push(key);
        }
        Ok(())
    }

    /// Ends key resolution.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if a requested key was not provided.
    pub fn keys_done(&mut self) -> Result<(), Error> {
        self.expect(State::NeedKeys)?;
        if let Some(missing) = self.key_requests.iter().find(|request| !self.satisfies(request)) {
            return Err(Error::KeyNotFound(missing.to_string()));
        }
        self.transition(State::NeedKms);
        self.advance_if_unwrapped();
        Ok(())
    }

    /// Supplies the cipher for the key with the given id.
    ///
    /// # Errors
    ///
    /// Returns error if called in another state or the key was never requested.
    pub fn provide_material(&mut self, id: Uuid, cipher: Arc<FieldCipher>) -> Result<(), Error> {
        self.expect(State::NeedKms)?;
        let key = self
            .keys
            .iter()
            .find(|key| key.id() == id)
            .ok_or_else(|| Error::KeyNotFound(KeyRef::Id(id).to_string()))?;
        self.ring.insert(key, cipher);
        self.advance_if_unwrapped();
        Ok(())
    }

    /// Supplies the final document.
    ///
    /// # Errors
    ///
    /// Returns error if called in another state.
    pub fn complete(&mut self, document: Document) -> Result<(), Error> {
        self.expect(State::Ready)?;
        self.finish(document);
        Ok(())
    }

    /// Moves the context to `Error` and returns the cause wrapped as an
    /// encryption error.
    pub fn fail(&mut self, cause: Error) -> Error {
        tracing::debug!(kind = ?self.kind, from = %self.state, error = %cause, "crypto context failed");
        self.state = State::Error;
        self.result = None;
        cause.into_encryption_error()
    }

    /// Returns the final document once `Done`.
    ///
    /// # Errors
    ///
    /// Returns error if the context is not done.
    pub fn into_result(self) -> Result<Document, Error> {
        match (self.state, self.result) {
            (State::Done, Some(result)) => Ok(result),
            (state, _) => Err(Error::Configuration(format!(
                "crypto context has no result in state {state}"
            ))),
        }
    }

    /// Returns the single value of an explicit operation once `Done`.
    ///
    /// # Errors
    ///
    /// Returns error if the context is not done.
    pub fn into_value(self) -> Result<Bson, Error> {
        let mut result = self.into_result()?;
        result
            .remove(VALUE_FIELD)
            .ok_or_else(|| Error::Encoding("explicit operation produced no value".to_string()))
    }

    /// Returns the single encrypted value of an explicit encryption once `Done`.
    ///
    /// # Errors
    ///
    /// Returns error if the context is not done.
    pub fn into_encrypted_value(self) -> Result<Binary, Error> {
        match self.into_value()? {
            Bson::Binary(binary) => Ok(binary),
            _ => Err(Error::Encoding("explicit encryption produced no binary".to_string())),
        }
    }

    fn request_keys(&mut self, requests: Vec<KeyRef>) {
        if requests.is_empty() {
            self.finish(self.document.clone());
        } else {
            self.key_requests = requests;
            self.transition(State::NeedKeys);
        }
    }

    fn satisfies(&self, request: &KeyRef) -> bool {
        self.keys.iter().any(|key| match request {
            KeyRef::Id(id) => key.id() == *id,
            KeyRef::AltName(name) => key.key_alt_names().contains(name),
        })
    }

    fn advance_if_unwrapped(&mut self) {
        if self.state == State::NeedKms && self.keys.iter().all(|key| self.ring.contains(&key.id())) {
            self.transition(State::Ready);
        }
    }

    fn finish(&mut self, document: Document) {
        self.result = Some(document);
        self.transition(State::Done);
    }

    fn transition(&mut self, next: State) {
        tracing::debug!(kind = ?self.kind, from = %self.state, to = %next, "crypto context transition");
        self.state = next;
    }

    fn expect(&self, expected: State) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "crypto context is in state {}, expected {expected}",
                self.state
            )))
        }
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("namespace", &self.namespace)
            .field("key_requests", &self.key_requests)
            .finish_non_exhaustive()
    }
}
