//! Configuration types, built from environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// One monitored mailbox account.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Short name used in logs (`primary`, `backup`, ...).
    pub name: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Login and own address (used for self-loop prevention).
    pub address: String,
    pub password: SecretString,
    /// Sender allowlist. `*` allows everyone, empty denies everyone.
    pub allowed_senders: Vec<String>,
}

/// Connection supervision policy shared by all accounts.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Use IMAP IDLE when the server advertises it.
    pub use_idle: bool,
    /// How long a single IDLE wait lasts before it is re-issued.
    pub idle_timeout: Duration,
    /// Poll interval when IDLE is unavailable.
    pub poll_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before the account is left disconnected.
    pub max_reconnect_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            use_idle: true,
            idle_timeout: Duration::from_secs(25 * 60),
            poll_interval: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 8,
        }
    }
}

/// An allow-listed submission credential.
#[derive(Debug, Clone)]
pub struct SubmissionUser {
    pub username: String,
    pub secret: SecretString,
}

/// Submission listener settings.
#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    /// Socket address to bind, e.g. `0.0.0.0:2525`.
    pub bind: String,
    /// Name announced in the greeting.
    pub hostname: String,
    pub users: Vec<SubmissionUser>,
    /// Upper bound on a buffered message.
    pub max_message_bytes: usize,
}

/// Known address tables for the router.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub catch_all: Vec<String>,
    pub direct_task: Vec<String>,
    pub intelligence: Vec<String>,
    /// Tenant used when neither the address nor the sender resolves one.
    pub default_tenant: String,
}

/// Batching queue policy.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub emergency_threshold: usize,
    pub max_retries: u32,
    pub tick_interval: Duration,
    /// Delay for a flush triggered by a full batch.
    pub immediate_flush_delay: Duration,
    /// Delay before re-flushing requeued items.
    pub retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            max_wait: Duration::from_secs(300),
            emergency_threshold: 100,
            max_retries: 3,
            tick_interval: Duration::from_secs(30),
            immediate_flush_delay: Duration::from_millis(100),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Fallback (single-item) processing policy.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Subject + body length above which batching is skipped.
    pub max_content_chars: usize,
    pub urgency_keywords: Vec<String>,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 12_000,
            urgency_keywords: ["urgent", "asap", "emergency", "critical", "immediately"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Extraction service endpoint.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub accounts: Vec<AccountConfig>,
    pub supervisor: SupervisorConfig,
    pub submission: Option<SubmissionConfig>,
    pub routing: RoutingConfig,
    pub batch: BatchConfig,
    pub fallback: FallbackConfig,
    pub extraction: ExtractionConfig,
    pub db_path: String,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let account_names = env.list("INTAKE_ACCOUNTS");
        let account_names = if account_names.is_empty() {
            vec!["PRIMARY".to_string()]
        } else {
            account_names
        };

        let mut accounts = Vec::new();
        for prefix in &account_names {
            let prefix = prefix.to_uppercase();
            // Accounts without an IMAP host are simply not monitored.
            if let Some(account) = env.account(&prefix)? {
                accounts.push(account);
            }
        }

        let defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            use_idle: env.parse("INTAKE_IDLE", defaults.use_idle)?,
            idle_timeout: Duration::from_secs(
                env.parse("INTAKE_IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs())?,
            ),
            poll_interval: Duration::from_secs(
                env.parse("INTAKE_POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?,
            ),
            reconnect_base_delay: Duration::from_millis(env.parse(
                "INTAKE_RECONNECT_BASE_MS",
                defaults.reconnect_base_delay.as_millis() as u64,
            )?),
            max_reconnect_attempts: env
                .parse("INTAKE_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts)?,
        };

        let submission = match env.get("INTAKE_SUBMISSION_BIND") {
            Some(bind) => Some(SubmissionConfig {
                bind,
                hostname: env
                    .get("INTAKE_SUBMISSION_HOSTNAME")
                    .unwrap_or_else(|| "mail-intake".to_string()),
                users: env.submission_users("INTAKE_SUBMISSION_USERS")?,
                max_message_bytes: env.parse("INTAKE_SUBMISSION_MAX_BYTES", 25 * 1024 * 1024)?,
            }),
            None => None,
        };

        let routing = RoutingConfig {
            catch_all: env.list("INTAKE_CATCH_ALL"),
            direct_task: env.list("INTAKE_TASK_ADDRESSES"),
            intelligence: env.list("INTAKE_INTEL_ADDRESSES"),
            default_tenant: env
                .get("INTAKE_DEFAULT_TENANT")
                .unwrap_or_else(|| "default".to_string()),
        };

        let b = BatchConfig::default();
        let batch = BatchConfig {
            max_batch_size: env.parse("BATCH_MAX_SIZE", b.max_batch_size)?,
            max_wait: Duration::from_millis(
                env.parse("BATCH_MAX_WAIT_MS", b.max_wait.as_millis() as u64)?,
            ),
            emergency_threshold: env.parse("BATCH_EMERGENCY_THRESHOLD", b.emergency_threshold)?,
            max_retries: env.parse("BATCH_MAX_RETRIES", b.max_retries)?,
            tick_interval: Duration::from_millis(
                env.parse("BATCH_TICK_MS", b.tick_interval.as_millis() as u64)?,
            ),
            immediate_flush_delay: b.immediate_flush_delay,
            retry_delay: Duration::from_millis(
                env.parse("BATCH_RETRY_DELAY_MS", b.retry_delay.as_millis() as u64)?,
            ),
        };
        if batch.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BATCH_MAX_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        if batch.emergency_threshold < batch.max_batch_size {
            return Err(ConfigError::InvalidValue {
                key: "BATCH_EMERGENCY_THRESHOLD".into(),
                message: format!(
                    "must not be below BATCH_MAX_SIZE ({})",
                    batch.max_batch_size
                ),
            });
        }

        let f = FallbackConfig::default();
        let keywords = env.list("FALLBACK_KEYWORDS");
        let fallback = FallbackConfig {
            max_content_chars: env.parse("FALLBACK_MAX_CHARS", f.max_content_chars)?,
            urgency_keywords: if keywords.is_empty() {
                f.urgency_keywords
            } else {
                keywords
            },
            max_retries: env.parse("FALLBACK_MAX_RETRIES", f.max_retries)?,
            base_delay: Duration::from_millis(
                env.parse("FALLBACK_BASE_DELAY_MS", f.base_delay.as_millis() as u64)?,
            ),
        };

        let extraction = ExtractionConfig {
            url: env.require("EXTRACTION_URL", "Set it to the extraction service base URL")?,
            api_key: env.get("EXTRACTION_API_KEY").map(SecretString::from),
            timeout: Duration::from_secs(env.parse("EXTRACTION_TIMEOUT_SECS", 60)?),
        };

        Ok(Self {
            accounts,
            supervisor,
            submission,
            routing,
            batch,
            fallback,
            extraction,
            db_path: env
                .get("INTAKE_DB_PATH")
                .unwrap_or_else(|| "./data/mail-intake.db".to_string()),
            shutdown_grace: Duration::from_secs(env.parse("INTAKE_SHUTDOWN_GRACE_SECS", 30)?),
        })
    }
}

/// Thin helper over a key lookup closure.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str, hint: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn account(&self, prefix: &str) -> Result<Option<AccountConfig>, ConfigError> {
        let Some(imap_host) = self.get(&format!("{prefix}_IMAP_HOST")) else {
            return Ok(None);
        };

        let address = self.require(
            &format!("{prefix}_ADDRESS"),
            "Every monitored account needs a login address",
        )?;
        let password = self.require(
            &format!("{prefix}_PASSWORD"),
            "Every monitored account needs a password",
        )?;
        let smtp_host = self
            .get(&format!("{prefix}_SMTP_HOST"))
            .unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let allowed = self.list(&format!("{prefix}_ALLOWED_SENDERS"));

        Ok(Some(AccountConfig {
            name: prefix.to_lowercase(),
            imap_port: self.parse(&format!("{prefix}_IMAP_PORT"), 993)?,
            smtp_port: self.parse(&format!("{prefix}_SMTP_PORT"), 587)?,
            imap_host,
            smtp_host,
            address,
            password: SecretString::from(password),
            allowed_senders: if allowed.is_empty() {
                vec!["*".to_string()]
            } else {
                allowed
            },
        }))
    }

    fn submission_users(&self, key: &str) -> Result<Vec<SubmissionUser>, ConfigError> {
        self.list(key)
            .into_iter()
            .map(|entry| match entry.split_once(':') {
                Some((user, secret)) if !user.is_empty() && !secret.is_empty() => {
                    Ok(SubmissionUser {
                        username: user.to_string(),
                        secret: SecretString::from(secret.to_string()),
                    })
                }
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "entries must look like user:secret".into(),
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = config_from(&[("EXTRACTION_URL", "http://extract.local")]).unwrap();
        assert!(cfg.accounts.is_empty());
        assert!(cfg.submission.is_none());
        assert_eq!(cfg.batch.max_batch_size, 20);
        assert_eq!(cfg.batch.emergency_threshold, 100);
        assert_eq!(cfg.routing.default_tenant, "default");
        assert_eq!(cfg.fallback.urgency_keywords.len(), 5);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn missing_extraction_url_is_an_error() {
        let err = config_from(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "EXTRACTION_URL"));
    }

    #[test]
    fn parses_primary_and_backup_accounts() {
        let cfg = config_from(&[
            ("EXTRACTION_URL", "http://extract.local"),
            ("INTAKE_ACCOUNTS", "primary, backup"),
            ("PRIMARY_IMAP_HOST", "imap.example.com"),
            ("PRIMARY_ADDRESS", "intake@example.com"),
            ("PRIMARY_PASSWORD", "hunter2"),
            ("BACKUP_IMAP_HOST", "imap.backup.net"),
            ("BACKUP_IMAP_PORT", "1993"),
            ("BACKUP_ADDRESS", "intake@backup.net"),
            ("BACKUP_PASSWORD", "swordfish"),
            ("BACKUP_ALLOWED_SENDERS", "@example.com"),
        ])
        .unwrap();

        assert_eq!(cfg.accounts.len(), 2);
        let primary = &cfg.accounts[0];
        assert_eq!(primary.name, "primary");
        assert_eq!(primary.smtp_host, "smtp.example.com");
        assert_eq!(primary.imap_port, 993);
        assert_eq!(primary.allowed_senders, vec!["*"]);
        assert_eq!(primary.password.expose_secret(), "hunter2");

        let backup = &cfg.accounts[1];
        assert_eq!(backup.imap_port, 1993);
        assert_eq!(backup.allowed_senders, vec!["@example.com"]);
    }

    #[test]
    fn account_without_password_is_rejected() {
        let err = config_from(&[
            ("EXTRACTION_URL", "http://extract.local"),
            ("PRIMARY_IMAP_HOST", "imap.example.com"),
            ("PRIMARY_ADDRESS", "intake@example.com"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "PRIMARY_PASSWORD"));
    }

    #[test]
    fn invalid_number_reports_key() {
        let err = config_from(&[
            ("EXTRACTION_URL", "http://extract.local"),
            ("BATCH_MAX_SIZE", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BATCH_MAX_SIZE"));
    }

    #[test]
    fn emergency_threshold_below_batch_size_is_rejected() {
        let err = config_from(&[
            ("EXTRACTION_URL", "http://extract.local"),
            ("BATCH_MAX_SIZE", "50"),
            ("BATCH_EMERGENCY_THRESHOLD", "10"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BATCH_EMERGENCY_THRESHOLD"));
    }

    #[test]
    fn submission_users_are_parsed() {
        let cfg = config_from(&[
            ("EXTRACTION_URL", "http://extract.local"),
            ("INTAKE_SUBMISSION_BIND", "127.0.0.1:2525"),
            ("INTAKE_SUBMISSION_USERS", "scanner:s3cret, crm:token"),
        ])
        .unwrap();
        let submission = cfg.submission.unwrap();
        assert_eq!(submission.users.len(), 2);
        assert_eq!(submission.users[0].username, "scanner");
        assert_eq!(submission.users[1].secret.expose_secret(), "token");
    }

    #[test]
    fn malformed_submission_user_is_rejected() {
        let err = config_from(&[
            ("EXTRACTION_URL", "http://extract.local"),
            ("INTAKE_SUBMISSION_BIND", "127.0.0.1:2525"),
            ("INTAKE_SUBMISSION_USERS", "nocolon"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
