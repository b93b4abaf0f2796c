//! STM and transaction configuration.

use crate::backoff::BackoffPolicy;
use crate::error::{StmError, StmResult};
use crate::orec::{DEFAULT_READ_BIASED_THRESHOLD, MAX_READ_BIASED_THRESHOLD};
use crate::transaction::{ListenerList, TransactionListener};
use crate::types::LockMode;
use std::sync::Arc;
use std::time::Duration;

/// Default number of spins a lock or arrive attempt makes before giving up.
pub const DEFAULT_SPIN_COUNT: u32 = 16;

/// Default number of attempts the executor makes before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 1000;

/// Default slot count of fixed-capacity transactions.
pub const DEFAULT_MAX_FIXED_CAPACITY: usize = 20;

/// Pessimistic locking applied when references are opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LockLevel {
    /// Optimistic: locks are only taken at prepare time.
    #[default]
    Default,
    /// Reads take a read lock; writes take a write lock.
    EnsureReads,
    /// Writes take a write lock.
    EnsureWrites,
    /// Reads and writes take the exclusive lock.
    PrivatizeReads,
    /// Writes take the exclusive lock.
    PrivatizeWrites,
}

impl LockLevel {
    /// Lock mode acquired when a reference is opened for reading.
    #[must_use]
    pub const fn read_lock_mode(self) -> LockMode {
        match self {
            Self::Default | Self::EnsureWrites | Self::PrivatizeWrites => LockMode::None,
            Self::EnsureReads => LockMode::Read,
            Self::PrivatizeReads => LockMode::Exclusive,
        }
    }

    /// Lock mode acquired when a reference is opened for writing.
    #[must_use]
    pub const fn write_lock_mode(self) -> LockMode {
        match self {
            Self::Default => LockMode::None,
            Self::EnsureReads | Self::EnsureWrites => LockMode::Write,
            Self::PrivatizeReads | Self::PrivatizeWrites => LockMode::Exclusive,
        }
    }
}

/// Isolation level of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsolationLevel {
    /// Reads are not re-validated against each other.
    ReadCommitted,
    /// Reads form a consistent snapshot; write skew is possible.
    #[default]
    Snapshot,
    /// Same guarantees as `Snapshot` for this engine.
    RepeatableRead,
    /// Reads are re-validated under a read lock at prepare, preventing write skew.
    Serializable,
}

impl IsolationLevel {
    /// Returns true if reads may come from different commits.
    #[must_use]
    pub const fn allows_inconsistent_reads(self) -> bool {
        matches!(self, Self::ReadCommitted)
    }

    /// Returns true if write skew is not detected.
    #[must_use]
    pub const fn allows_write_skew(self) -> bool {
        !matches!(self, Self::Serializable)
    }
}

/// Configuration of the transactions created by one executor.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransactionConfig {
    /// Name used in logs and errors for this family of transactions.
    pub family_name: String,

    /// Whether writes, commutes and constructions are rejected.
    pub readonly: bool,

    /// Pessimistic locking applied on open.
    pub lock_level: LockLevel,

    /// Isolation level.
    pub isolation_level: IsolationLevel,

    /// Whether a written value equal to the old value is treated as unchanged.
    pub dirty_check: bool,

    /// Whether reads of read-biased references are kept in the transaction.
    pub track_reads: bool,

    /// Whether `retry` may block.
    pub blocking_allowed: bool,

    /// Total time a transaction may spend blocked in retries (`None` = unbounded).
    pub timeout: Option<Duration>,

    /// Maximum number of attempts before the executor gives up.
    pub max_retries: u32,

    /// Spins per lock or arrive attempt.
    pub spin_count: u32,

    /// Whether the executor starts with the cheapest transaction variant and
    /// upgrades on demand.
    pub speculative_config_enabled: bool,

    /// Slot count of array-backed transactions; larger transactions use a map.
    pub max_fixed_capacity: usize,

    /// Backoff between attempts after a conflict.
    pub backoff: BackoffPolicy,

    /// Listeners notified for every transaction of this configuration.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub permanent_listeners: ListenerList,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            family_name: String::from("default"),
            readonly: false,
            lock_level: LockLevel::Default,
            isolation_level: IsolationLevel::Snapshot,
            dirty_check: true,
            track_reads: true,
            blocking_allowed: true,
            timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            spin_count: DEFAULT_SPIN_COUNT,
            speculative_config_enabled: true,
            max_fixed_capacity: DEFAULT_MAX_FIXED_CAPACITY,
            backoff: BackoffPolicy::default(),
            permanent_listeners: ListenerList::default(),
        }
    }
}

impl TransactionConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the family name.
    #[must_use]
    pub fn family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = name.into();
        self
    }

    /// Sets whether the transaction is readonly.
    #[must_use]
    pub fn readonly(mut self, value: bool) -> Self {
        self.readonly = value;
        self
    }

    /// Sets the lock level.
    #[must_use]
    pub fn lock_level(mut self, level: LockLevel) -> Self {
        self.lock_level = level;
        self
    }

    /// Sets the isolation level.
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Sets whether dirty checking is enabled.
    #[must_use]
    pub fn dirty_check(mut self, value: bool) -> Self {
        self.dirty_check = value;
        self
    }

    /// Sets whether reads are tracked.
    #[must_use]
    pub fn track_reads(mut self, value: bool) -> Self {
        self.track_reads = value;
        self
    }

    /// Sets whether retry may block.
    #[must_use]
    pub fn blocking_allowed(mut self, value: bool) -> Self {
        self.blocking_allowed = value;
        self
    }

    /// Sets the retry timeout budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    /// Sets the spin count.
    #[must_use]
    pub fn spin_count(mut self, value: u32) -> Self {
        self.spin_count = value;
        self
    }

    /// Sets whether speculative configuration is enabled.
    #[must_use]
    pub fn speculative_config_enabled(mut self, value: bool) -> Self {
        self.speculative_config_enabled = value;
        self
    }

    /// Sets the slot count of array-backed transactions.
    #[must_use]
    pub fn max_fixed_capacity(mut self, value: usize) -> Self {
        self.max_fixed_capacity = value;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    /// Adds a permanent lifecycle listener.
    #[must_use]
    pub fn permanent_listener(mut self, listener: Arc<dyn TransactionListener>) -> Self {
        self.permanent_listeners.push(listener);
        self
    }

    /// Lock mode applied to reads.
    #[must_use]
    pub fn read_lock_mode(&self) -> LockMode {
        self.lock_level.read_lock_mode()
    }

    /// Lock mode applied to writes.
    #[must_use]
    pub fn write_lock_mode(&self) -> LockMode {
        self.lock_level.write_lock_mode()
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> StmResult<()> {
        if self.max_retries == 0 {
            return Err(StmError::invalid_configuration(
                "max_retries must be at least 1",
            ));
        }
        if self.max_fixed_capacity < 2 {
            return Err(StmError::invalid_configuration(
                "max_fixed_capacity must be at least 2",
            ));
        }
        if self.readonly && self.lock_level.write_lock_mode() == LockMode::Exclusive {
            return Err(StmError::invalid_configuration(
                "readonly transactions cannot privatize writes",
            ));
        }
        if !self.track_reads {
            // Untracked reads leave nothing to lock at prepare or to wait on.
            if !self.isolation_level.allows_write_skew() && !self.readonly {
                return Err(StmError::invalid_configuration(format!(
                    "[{}] serializable isolation requires read tracking",
                    self.family_name
                )));
            }
            if self.blocking_allowed {
                return Err(StmError::invalid_configuration(format!(
                    "[{}] blocking retries require read tracking",
                    self.family_name
                )));
            }
            if self.read_lock_mode() != LockMode::None {
                return Err(StmError::invalid_configuration(format!(
                    "[{}] lock level {:?} locks reads and requires read tracking",
                    self.family_name, self.lock_level
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of an [`Stm`](crate::Stm) instance.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StmConfig {
    /// Consecutive read-only departs after which a reference becomes read-biased.
    pub read_biased_threshold: u32,

    /// Spins per lock attempt of atomic operations outside transactions.
    pub spin_count: u32,

    /// Lock attempts atomic operations make before failing.
    pub atomic_lock_attempts: u32,

    /// Configuration used by [`Stm::atomic`](crate::Stm::atomic) and
    /// [`Stm::new_transaction`](crate::Stm::new_transaction).
    pub transaction: TransactionConfig,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            read_biased_threshold: DEFAULT_READ_BIASED_THRESHOLD,
            spin_count: DEFAULT_SPIN_COUNT,
            atomic_lock_attempts: 64,
            transaction: TransactionConfig::default(),
        }
    }
}

impl StmConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read-biased threshold.
    #[must_use]
    pub fn read_biased_threshold(mut self, value: u32) -> Self {
        self.read_biased_threshold = value;
        self
    }

    /// Sets the spin count of atomic operations.
    #[must_use]
    pub fn spin_count(mut self, value: u32) -> Self {
        self.spin_count = value;
        self
    }

    /// Sets the lock attempts of atomic operations.
    #[must_use]
    pub fn atomic_lock_attempts(mut self, value: u32) -> Self {
        self.atomic_lock_attempts = value;
        self
    }

    /// Sets the default transaction configuration.
    #[must_use]
    pub fn transaction(mut self, config: TransactionConfig) -> Self {
        self.transaction = config;
        self
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> StmResult<()> {
        if !(1..=MAX_READ_BIASED_THRESHOLD).contains(&self.read_biased_threshold) {
            return Err(StmError::invalid_configuration(format!(
                "read_biased_threshold must be in 1..={MAX_READ_BIASED_THRESHOLD}, got {}",
                self.read_biased_threshold
            )));
        }
        if self.atomic_lock_attempts == 0 {
            return Err(StmError::invalid_configuration(
                "atomic_lock_attempts must be at least 1",
            ));
        }
        self.transaction.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TransactionConfig::default();
        assert!(!config.readonly);
        assert!(config.dirty_check);
        assert!(config.track_reads);
        assert!(config.blocking_allowed);
        assert!(config.speculative_config_enabled);
        assert_eq!(config.timeout, None);
        assert_eq!(config.spin_count, DEFAULT_SPIN_COUNT);
        assert_eq!(config.lock_level, LockLevel::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = TransactionConfig::new()
            .family_name("transfer")
            .readonly(true)
            .isolation_level(IsolationLevel::Serializable)
            .timeout(Some(Duration::from_millis(50)))
            .max_retries(7);

        assert_eq!(config.family_name, "transfer");
        assert!(config.readonly);
        assert!(!config.isolation_level.allows_write_skew());
        assert_eq!(config.timeout, Some(Duration::from_millis(50)));
        assert_eq!(config.max_retries, 7);
    }

    #[test]
    fn lock_levels_map_to_lock_modes() {
        assert_eq!(LockLevel::Default.read_lock_mode(), LockMode::None);
        assert_eq!(LockLevel::Default.write_lock_mode(), LockMode::None);
        assert_eq!(LockLevel::EnsureReads.read_lock_mode(), LockMode::Read);
        assert_eq!(LockLevel::EnsureWrites.write_lock_mode(), LockMode::Write);
        assert_eq!(LockLevel::PrivatizeReads.read_lock_mode(), LockMode::Exclusive);
        assert_eq!(LockLevel::PrivatizeWrites.read_lock_mode(), LockMode::None);
        assert_eq!(LockLevel::PrivatizeWrites.write_lock_mode(), LockMode::Exclusive);
    }

    #[test]
    fn only_serializable_detects_write_skew() {
        assert!(IsolationLevel::ReadCommitted.allows_write_skew());
        assert!(IsolationLevel::Snapshot.allows_write_skew());
        assert!(IsolationLevel::RepeatableRead.allows_write_skew());
        assert!(!IsolationLevel::Serializable.allows_write_skew());
        assert!(IsolationLevel::ReadCommitted.allows_inconsistent_reads());
        assert!(!IsolationLevel::Snapshot.allows_inconsistent_reads());
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let config = StmConfig::new().read_biased_threshold(0);
        assert!(matches!(
            config.validate(),
            Err(StmError::InvalidConfiguration { .. })
        ));
        let config = StmConfig::new().read_biased_threshold(MAX_READ_BIASED_THRESHOLD + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retries_is_rejected() {
        assert!(TransactionConfig::new().max_retries(0).validate().is_err());
    }

    #[test]
    fn untracked_reads_need_compatible_settings() {
        let untracked = TransactionConfig::new()
            .track_reads(false)
            .blocking_allowed(false);
        assert!(untracked.clone().validate().is_ok());

        for config in [
            untracked
                .clone()
                .isolation_level(IsolationLevel::Serializable),
            untracked.clone().blocking_allowed(true),
            untracked.clone().lock_level(LockLevel::EnsureReads),
            untracked.clone().lock_level(LockLevel::PrivatizeReads),
        ] {
            assert!(matches!(
                config.validate(),
                Err(StmError::InvalidConfiguration { .. })
            ));
        }

        let readonly_serializable = untracked
            .readonly(true)
            .isolation_level(IsolationLevel::Serializable);
        assert!(readonly_serializable.validate().is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_loads_from_partial_json() {
        let json = r#"{
            "read_biased_threshold": 32,
            "transaction": {
                "family_name": "accounts",
                "isolation_level": "Serializable",
                "lock_level": "EnsureWrites"
            }
        }"#;
        let config: StmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.read_biased_threshold, 32);
        assert_eq!(config.spin_count, DEFAULT_SPIN_COUNT);
        assert_eq!(config.transaction.family_name, "accounts");
        assert_eq!(config.transaction.isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.transaction.lock_level, LockLevel::EnsureWrites);
        assert!(config.transaction.dirty_check);
        assert!(config.validate().is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_serializes_without_listeners() {
        let config = TransactionConfig::new().family_name("json");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"family_name\":\"json\""));
        assert!(!json.contains("permanent_listeners"));
    }
}
