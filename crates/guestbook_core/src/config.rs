//! Explicit configuration objects.
//!
//! # Responsibility
//! - Carry store retry/limit settings and guestbook policy settings.
//! - Deserialize from JSON so the hosting layer can load them from a file.
//!
//! # Invariants
//! - Every field has a default; partial JSON documents are accepted.
//! - Configuration is passed by value into stores and services. There is no
//!   process-wide configuration singleton.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 10;
const DEFAULT_MAX_DELAY_MS: u64 = 100;
const DEFAULT_MAX_GROUPS_PER_TRANSACTION: usize = 25;
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Retry behavior for optimistic transactions.
///
/// Backoff doubles per attempt starting at `base_delay_ms`, capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, conflicts surface immediately.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63) as u32;
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Settings shared by every `EntityStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub retry: RetryConfig,
    /// Distinct keys one transaction may touch before it fails with
    /// `TooManyGroups`.
    pub max_groups_per_transaction: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_groups_per_transaction: DEFAULT_MAX_GROUPS_PER_TRANSACTION,
        }
    }
}

impl StoreConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups_per_transaction = max_groups;
        self
    }
}

/// Whether book names are unique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookNamePolicy {
    /// One book per name, enforced by the `BookName` index.
    #[default]
    Unique,
    /// Names are labels only; duplicates are allowed.
    AllowDuplicates,
}

/// How `rename_book` treats a book's greetings under the unique policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameStrategy {
    /// Keep the book id and swap index entries. Greetings are untouched.
    #[default]
    InPlace,
    /// Move to a new book id, copying every greeting and retiring the old
    /// book. Bounded by the transaction group limit.
    CopyChildren,
}

/// Guestbook service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestbookConfig {
    pub book_names: BookNamePolicy,
    pub rename: RenameStrategy,
    /// Default and maximum number of greetings per listing.
    pub page_size: u32,
}

impl Default for GuestbookConfig {
    fn default() -> Self {
        Self {
            book_names: BookNamePolicy::default(),
            rename: RenameStrategy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl GuestbookConfig {
    /// Parses a JSON document; missing fields take defaults.
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    pub fn with_book_names(mut self, policy: BookNamePolicy) -> Self {
        self.book_names = policy;
        self
    }

    pub fn with_rename(mut self, strategy: RenameStrategy) -> Self {
        self.rename = strategy;
        self
    }

    /// Normalizes a requested greeting limit: `None` or `0` -> page size,
    /// larger values clamp to page size.
    pub fn greeting_limit(&self, requested: Option<u32>) -> u32 {
        let page_size = self.page_size.max(1);
        match requested {
            None | Some(0) => page_size,
            Some(value) => value.min(page_size),
        }
    }
}
