//! Domain identifiers (strongly-typed IDs)
//!
//! # ID の種類
//! - `TaskId`: エンジンが採番する。ワーカーにとっては不透明な文字列
//! - `Topic`: 処理の種類。handler のルーティングに使う
//! - `WorkerId`: 設定値、なければ `worker-<ULID>` を生成
//!
//! # Phantom Type パターン
//! `Id<T>` で共通実装を持ち、`T` はマーカー型（PhantomData）です。
//! `TaskId` を `WorkerId` の位置に渡すとコンパイルエラーになります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used when an id of this kind is generated locally.
    fn prefix() -> &'static str;
}

/// Generic string id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Generate a fresh, time-sortable id such as `worker-01J...`.
    pub fn generate() -> Self {
        Self::new(format!("{}{}", T::prefix(), Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// External task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Worker marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of a claimed external task (assigned by the engine).
pub type TaskId = Id<Task>;

/// Identity this process presents to the engine when locking tasks.
pub type WorkerId = Id<Worker>;

/// Name of a kind of work; used to route a task to its handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_worker_ids_are_prefixed_and_unique() {
        let a = WorkerId::generate();
        let b = WorkerId::generate();

        assert!(a.as_str().starts_with("worker-"));
        assert_ne!(a, b);
    }

    #[test]
    fn task_id_serializes_as_plain_string() {
        let id = TaskId::new("8c4e6f2a-1");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"8c4e6f2a-1\"");

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn topic_displays_its_name() {
        assert_eq!(Topic::new("process-payment").to_string(), "process-payment");
    }
}
