use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which lease backend coordinates node roles and cycle locks
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    #[default]
    File,
    Redis,
}

/// Process-wide settings, fixed for the lifetime of the process
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_exchange")]
    pub exchange_name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub api_key_testnet: String,
    #[serde(default)]
    pub secret_key_testnet: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub lease_backend: LeaseBackend,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default)]
    pub telegram_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<i64>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_strategy_path")]
    pub strategy_path: PathBuf,
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_filter() -> String {
    "cryptopump=info".to_string()
}

fn default_strategy_path() -> PathBuf {
    PathBuf::from("config/config.yml")
}

impl AppConfig {
    /// Load from an optional file, then `CRYPTOPUMP_*` environment variables
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("CRYPTOPUMP").try_parsing(true))
            .build()?;

        let app: AppConfig = settings.try_deserialize()?;
        if app.lease_backend == LeaseBackend::Redis && app.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "lease_backend = redis requires redis_url".to_string(),
            ));
        }
        Ok(app)
    }

    /// API credentials for the selected network
    pub fn credentials(&self, testnet: bool) -> (&str, &str) {
        if testnet {
            (&self.api_key_testnet, &self.secret_key_testnet)
        } else {
            (&self.api_key, &self.secret_key)
        }
    }
}

/// Strategy thresholds, typed once at load time
///
/// Ratios are fractions (0.01 = 1%), waits are seconds.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyParameters {
    pub symbol: String,
    pub symbol_fiat: String,
    /// Fiat kept aside and never deployed
    pub symbol_fiat_stash: f64,

    pub profit_min: f64,
    pub exchange_commission: f64,

    pub buy_rsi7_entry: f64,
    pub buy_24hs_highprice_entry: f64,
    pub buy_direction_up: i64,
    pub buy_direction_down: i64,
    pub buy_quantity_fiat_init: f64,
    pub buy_quantity_fiat_up: f64,
    pub buy_quantity_fiat_down: f64,
    pub buy_repeat_threshold_up: f64,
    pub buy_repeat_threshold_down: f64,
    /// Replaces `buy_repeat_threshold_down` after two BUYs in a row; 0 means twice it
    pub buy_repeat_threshold_down_second: f64,
    pub buy_repeat_threshold_down_second_start_count: usize,
    pub buy_wait: u64,

    pub sell_wait_before_cancel: u64,
    pub sell_wait_after_cancel: u64,
    pub sell_to_cover: bool,
    pub sell_hold_on_rsi3: f64,
    /// 0 disables the stoploss
    pub stoploss: f64,

    pub exit: bool,
    pub dry_run: bool,
    pub new_session: bool,
    pub test_net: bool,

    pub time_enforce: bool,
    pub time_start: String,
    pub time_stop: String,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            symbol_fiat: "USDT".to_string(),
            symbol_fiat_stash: 0.0,
            profit_min: 0.01,
            exchange_commission: 0.001,
            buy_rsi7_entry: 30.0,
            buy_24hs_highprice_entry: 0.01,
            buy_direction_up: 0,
            buy_direction_down: 0,
            buy_quantity_fiat_init: 20.0,
            buy_quantity_fiat_up: 20.0,
            buy_quantity_fiat_down: 20.0,
            buy_repeat_threshold_up: 0.01,
            buy_repeat_threshold_down: 0.02,
            buy_repeat_threshold_down_second: 0.04,
            buy_repeat_threshold_down_second_start_count: 3,
            buy_wait: 60,
            sell_wait_before_cancel: 30,
            sell_wait_after_cancel: 60,
            sell_to_cover: false,
            sell_hold_on_rsi3: 70.0,
            stoploss: 0.0,
            exit: false,
            dry_run: false,
            new_session: false,
            test_net: false,
            time_enforce: false,
            time_start: "00:00".to_string(),
            time_stop: "23:59".to_string(),
        }
    }
}

impl StrategyParameters {
    /// Load from a YAML file with `CRYPTOPUMP_STRATEGY_*` overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("CRYPTOPUMP_STRATEGY").try_parsing(true))
            .build()?;

        let params: StrategyParameters = settings.try_deserialize()?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.is_empty() || self.symbol_fiat.is_empty() {
            return Err(ConfigError::Invalid("symbol and symbol_fiat are required".into()));
        }
        if !self.symbol.ends_with(&self.symbol_fiat) {
            return Err(ConfigError::Invalid(format!(
                "symbol {} is not quoted in {}",
                self.symbol, self.symbol_fiat
            )));
        }
        let ratios = [
            ("profit_min", self.profit_min),
            ("exchange_commission", self.exchange_commission),
            ("buy_repeat_threshold_up", self.buy_repeat_threshold_up),
            ("buy_repeat_threshold_down", self.buy_repeat_threshold_down),
            ("stoploss", self.stoploss),
        ];
        for (name, value) in ratios {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{} must be in [0, 1)", name)));
            }
        }
        Ok(())
    }

    /// Base asset of the traded pair (BTC for BTCUSDT)
    pub fn base_asset(&self) -> &str {
        self.symbol
            .strip_suffix(&self.symbol_fiat)
            .unwrap_or(&self.symbol)
    }

    /// Whether `now` falls in the `[time_start, time_stop]` operating window
    ///
    /// Always true when the window is not enforced. A window whose stop
    /// precedes its start wraps midnight.
    pub fn in_operating_window(&self, now: NaiveTime) -> bool {
        if !self.time_enforce {
            return true;
        }
        match (parse_hhmm(&self.time_start), parse_hhmm(&self.time_stop)) {
            (Some(start), Some(stop)) => is_in_time_range(start, stop, now),
            _ => {
                tracing::warn!(
                    start = %self.time_start,
                    stop = %self.time_stop,
                    "Unparseable operating window, ignoring it"
                );
                true
            }
        }
    }

    /// Down-threshold used after two consecutive BUYs
    pub fn down_threshold_second(&self) -> f64 {
        if self.buy_repeat_threshold_down_second > 0.0 {
            self.buy_repeat_threshold_down_second
        } else {
            self.buy_repeat_threshold_down * 2.0
        }
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

pub fn is_in_time_range(start: NaiveTime, stop: NaiveTime, now: NaiveTime) -> bool {
    if start <= stop {
        start <= now && now <= stop
    } else {
        now >= start || now <= stop
    }
}

/// Startup settings that outrank the strategy file
///
/// Command-line flags can only switch a mode on, and a resumed cycle
/// keeps trading the symbol it was started with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub dry_run: bool,
    pub test_net: bool,
    pub new_session: bool,
    pub symbol: Option<String>,
}

impl Overrides {
    pub fn apply(&self, params: &mut StrategyParameters) {
        params.dry_run |= self.dry_run;
        params.test_net |= self.test_net;
        params.new_session |= self.new_session;
        if let Some(symbol) = &self.symbol {
            params.symbol = symbol.clone();
        }
    }
}

/// Shared handle to the current parameter snapshot
///
/// Readers clone the inner `Arc`, so one decision always sees one
/// consistent set of fields even if a reload lands mid-tick.
#[derive(Clone)]
pub struct ParamsHandle {
    current: Arc<RwLock<Arc<StrategyParameters>>>,
    path: Option<PathBuf>,
    overrides: Overrides,
}

impl ParamsHandle {
    pub fn new(params: StrategyParameters, path: Option<PathBuf>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(params))),
            path,
            overrides: Overrides::default(),
        }
    }

    /// Apply `overrides` now and after every reload
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        let mut params = (*self.snapshot()).clone();
        overrides.apply(&mut params);
        self.replace(params);
        self.overrides = overrides;
        self
    }

    pub fn snapshot(&self) -> Arc<StrategyParameters> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, params: StrategyParameters) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(params);
    }

    /// Re-read the backing file; keeps the previous snapshot on failure
    pub fn reload(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };

        match StrategyParameters::load(path) {
            Ok(mut params) => {
                self.overrides.apply(&mut params);
                if *self.snapshot() != params {
                    tracing::info!(path = %path.display(), "Strategy parameters changed");
                }
                self.replace(params);
                true
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Keeping previous strategy parameters");
                false
            }
        }
    }
}
