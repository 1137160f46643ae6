use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{Environment, Taxpayer};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub taxpayers: Vec<TaxpayerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_endpoint_production")]
    pub endpoint_production: String,
    #[serde(default = "default_endpoint_homologation")]
    pub endpoint_homologation: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            endpoint_production: default_endpoint_production(),
            endpoint_homologation: default_endpoint_homologation(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ServiceConfig {
    pub fn endpoint(&self) -> &str {
        match self.environment {
            Environment::Production => &self.endpoint_production,
            Environment::Homologation => &self.endpoint_homologation,
        }
    }
}

fn default_endpoint_production() -> String {
    "https://www1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx".to_string()
}
fn default_endpoint_homologation() -> String {
    "https://hom1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_batches")]
    pub max_batches_per_cycle: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: default_cooldown_minutes(),
            max_workers: default_max_workers(),
            max_batches_per_cycle: default_max_batches(),
        }
    }
}

impl SyncConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes)
    }
}

fn default_cooldown_minutes() -> i64 {
    65
}
fn default_max_workers() -> usize {
    4
}
fn default_max_batches() -> u32 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackfillConfig {
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default)]
    pub auto_after_sync: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_per_hour: default_max_per_hour(),
            min_interval_ms: default_min_interval_ms(),
            checkpoint_every: default_checkpoint_every(),
            auto_after_sync: false,
        }
    }
}

fn default_max_per_hour() -> u32 {
    20
}
fn default_min_interval_ms() -> u64 {
    1200
}
fn default_checkpoint_every() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaxpayerConfig {
    pub tax_id: String,
    pub uf: String,
    #[serde(default)]
    pub name: Option<String>,
    /// PEM bundle holding the client certificate chain and private key.
    pub identity_pem: PathBuf,
}

impl TaxpayerConfig {
    pub fn to_taxpayer(&self) -> Taxpayer {
        Taxpayer {
            tax_id: self.tax_id.clone(),
            uf_code: self.uf.clone(),
            name: self.name.clone(),
        }
    }
}

impl Config {
    /// Configuration with defaults everywhere but the database path.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            service: ServiceConfig::default(),
            sync: SyncConfig::default(),
            backfill: BackfillConfig::default(),
            taxpayers: Vec::new(),
        }
    }

    pub fn taxpayer(&self, tax_id: &str) -> Option<&TaxpayerConfig> {
        self.taxpayers.iter().find(|t| t.tax_id == tax_id)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.sync.cooldown_minutes <= 0 {
        anyhow::bail!("sync.cooldown_minutes must be > 0");
    }
    if config.sync.max_workers == 0 {
        anyhow::bail!("sync.max_workers must be > 0");
    }
    if config.sync.max_batches_per_cycle == 0 {
        anyhow::bail!("sync.max_batches_per_cycle must be > 0");
    }

    if config.backfill.max_per_hour == 0 {
        anyhow::bail!("backfill.max_per_hour must be > 0");
    }
    if config.backfill.checkpoint_every == 0 {
        anyhow::bail!("backfill.checkpoint_every must be > 0");
    }

    if config.service.timeout_secs == 0 {
        anyhow::bail!("service.timeout_secs must be > 0");
    }

    for tp in &config.taxpayers {
        validate_tax_id(&tp.tax_id)?;
        validate_uf(&tp.uf)?;
    }

    Ok(())
}

pub fn validate_tax_id(tax_id: &str) -> Result<()> {
    if !matches!(tax_id.len(), 11 | 14) || !tax_id.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!(
            "Invalid tax id '{}': expected 14-digit CNPJ or 11-digit CPF",
            tax_id
        );
    }
    Ok(())
}

pub fn validate_uf(uf: &str) -> Result<()> {
    let code: u32 = uf
        .parse()
        .with_context(|| format!("Invalid UF code '{}'", uf))?;
    if uf.len() != 2 || !(11..=53).contains(&code) {
        anyhow::bail!("Invalid UF code '{}': expected IBGE code 11..53", uf);
    }
    Ok(())
}
