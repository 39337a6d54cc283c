//! Session persistence owned by the scheduler.
//!
//! Session state is saved as JSON under `"<role>/<cycle>/<txid>:<vout>"` in a
//! caller-provided [`StateStore`]. Sessions of different cycles and escrows
//! never share an entry.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use bitcoin::OutPoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, TumblerError};

/// External key-value store for session state.
pub trait StateStore {
    /// # Errors
    /// Returns `TumblerError::Store` if the backend fails.
    fn put(&mut self, key: &str, value: String) -> Result<()>;

    /// # Errors
    /// Returns `TumblerError::Store` if the backend fails.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// # Errors
    /// Returns `TumblerError::Store` if the backend fails.
    fn delete(&mut self, key: &str) -> Result<()>;

    /// Every key starting with `prefix`, in ascending order.
    ///
    /// # Errors
    /// Returns `TumblerError::Store` if the backend fails.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process store.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn put(&mut self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Which protocol side a stored session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    SolverServer,
    SolverClient,
    PromiseServer,
    PromiseClient,
}

impl SessionRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SolverServer => "solver-server",
            Self::SolverClient => "solver-client",
            Self::PromiseServer => "promise-server",
            Self::PromiseClient => "promise-client",
        }
    }
}

/// A session is identified by its cycle and the escrow it is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub cycle: u32,
    pub escrow: OutPoint,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cycle, self.escrow)
    }
}

impl FromStr for SessionId {
    type Err = TumblerError;

    fn from_str(s: &str) -> Result<Self> {
        let (cycle, escrow) = s
            .split_once('/')
            .ok_or(TumblerError::DecodeError("session id has no separator"))?;
        Ok(Self {
            cycle: cycle.parse().map_err(|_| TumblerError::DecodeError("bad cycle"))?,
            escrow: escrow.parse().map_err(|_| TumblerError::DecodeError("bad escrow outpoint"))?,
        })
    }
}

/// Scheduler-owned map of session states, keyed by role and session id.
#[derive(Debug, Default)]
pub struct SessionRegistry<S> {
    store: S,
}

impl<S: StateStore> SessionRegistry<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    fn key(role: SessionRole, id: &SessionId) -> String {
        format!("{}/{id}", role.as_str())
    }

    /// # Errors
    /// `Serialization` if the state does not encode, `Store` on backend failure.
    pub fn save<T: Serialize>(&mut self, role: SessionRole, id: &SessionId, state: &T) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.store.put(&Self::key(role, id), json)?;
        debug!(role = role.as_str(), session = %id, "session saved");
        Ok(())
    }

    /// # Errors
    /// `Serialization` if the stored state does not decode, `Store` on backend failure.
    pub fn load<T: DeserializeOwned>(&self, role: SessionRole, id: &SessionId) -> Result<Option<T>> {
        self.store
            .get(&Self::key(role, id))?
            .map(|json| serde_json::from_str(&json).map_err(TumblerError::from))
            .transpose()
    }

    /// # Errors
    /// `Store` on backend failure.
    pub fn remove(&mut self, role: SessionRole, id: &SessionId) -> Result<()> {
        self.store.delete(&Self::key(role, id))?;
        debug!(role = role.as_str(), session = %id, "session removed");
        Ok(())
    }

    /// Ids of every stored session of `role`.
    ///
    /// # Errors
    /// `DecodeError` for a malformed stored key, `Store` on backend failure.
    pub fn ids(&self, role: SessionRole) -> Result<Vec<SessionId>> {
        let prefix = format!("{}/", role.as_str());
        self.store
            .keys(&prefix)?
            .iter()
            .map(|k| k[prefix.len()..].parse())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::outpoint;

    #[test]
    fn session_id_text_form() {
        let id = SessionId { cycle: 12, escrow: outpoint(1) };
        let text = id.to_string();
        assert!(text.starts_with("12/"));
        assert_eq!(text.parse::<SessionId>().unwrap(), id);
        assert!("12".parse::<SessionId>().is_err());
        assert!("x/00:0".parse::<SessionId>().is_err());
    }

    #[test]
    fn registry_separates_roles_and_sessions() {
        let mut reg = SessionRegistry::new(MemoryStore::new());
        let a = SessionId { cycle: 1, escrow: outpoint(1) };
        let b = SessionId { cycle: 2, escrow: outpoint(1) };
        reg.save(SessionRole::SolverServer, &a, &"alpha").unwrap();
        reg.save(SessionRole::SolverServer, &b, &"beta").unwrap();
        reg.save(SessionRole::PromiseClient, &a, &"gamma").unwrap();

        assert_eq!(reg.load::<String>(SessionRole::SolverServer, &a).unwrap().as_deref(), Some("alpha"));
        assert_eq!(reg.load::<String>(SessionRole::SolverClient, &a).unwrap(), None);
        assert_eq!(reg.ids(SessionRole::SolverServer).unwrap(), vec![a, b]);

        reg.remove(SessionRole::SolverServer, &a).unwrap();
        assert_eq!(reg.ids(SessionRole::SolverServer).unwrap(), vec![b]);
        assert_eq!(reg.store().len(), 2);
    }

    #[test]
    fn corrupt_state_is_a_serialization_error() {
        let mut store = MemoryStore::new();
        let id = SessionId { cycle: 3, escrow: outpoint(2) };
        store.put(&format!("solver-client/{id}"), "{".into()).unwrap();
        let reg = SessionRegistry::new(store);
        assert!(matches!(
            reg.load::<u32>(SessionRole::SolverClient, &id),
            Err(TumblerError::Serialization(_))
        ));
    }
}
