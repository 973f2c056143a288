use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: Option<String>,
  pub rabbitmq_url: Option<String>,
  pub server_port: u16,
  pub assign_max_retries: usize,
  pub retry_base_ms: u64,
  pub leave_grace_secs: u64,
  pub redispatch_on_reject: bool,
}

/// Engine knobs, separated from process wiring so tests can build them directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
  /// Attempts for operations that hit an optimistic conflict.
  pub max_retries: usize,
  pub retry_base: Duration,
  /// How long a left entry stays visible as `cancelled`. Zero deletes it in
  /// the same batch as the compaction.
  pub leave_grace: Duration,
  pub redispatch_on_reject: bool,
}

impl Default for Policy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      retry_base: Duration::from_millis(10),
      leave_grace: Duration::ZERO,
      redispatch_on_reject: false,
    }
  }
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
  env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
  pub fn from_env() -> Self {
    let defaults = Policy::default();
    Self {
      database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
      rabbitmq_url: env::var("RABBITMQ_URL").ok().filter(|v| !v.is_empty()),
      server_port: var_or("SERVER_PORT", 8080),
      assign_max_retries: var_or("ASSIGN_MAX_RETRIES", defaults.max_retries),
      retry_base_ms: var_or("RETRY_BASE_MS", defaults.retry_base.as_millis() as u64),
      leave_grace_secs: var_or("LEAVE_GRACE_SECS", 0),
      redispatch_on_reject: var_or("REDISPATCH_ON_REJECT", false),
    }
  }

  pub fn policy(&self) -> Policy {
    Policy {
      max_retries: self.assign_max_retries.max(1),
      retry_base: Duration::from_millis(self.retry_base_ms),
      leave_grace: Duration::from_secs(self.leave_grace_secs),
      redispatch_on_reject: self.redispatch_on_reject,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn policy_never_drops_below_one_attempt() {
    let config = Config {
      database_url: None,
      rabbitmq_url: None,
      server_port: 8080,
      assign_max_retries: 0,
      retry_base_ms: 20,
      leave_grace_secs: 3,
      redispatch_on_reject: true,
    };
    let policy = config.policy();
    assert_eq!(policy.max_retries, 1);
    assert_eq!(policy.retry_base, Duration::from_millis(20));
    assert_eq!(policy.leave_grace, Duration::from_secs(3));
    assert!(policy.redispatch_on_reject);
  }
}
