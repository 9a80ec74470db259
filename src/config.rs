//! Environment-driven configuration for the pipeline.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::convert::ProcessConverter;
use crate::sequence::RegistrationFormat;

const DEFAULT_TEMPLATE_DIR: &str = "./templates";
const DEFAULT_ARTIFACT_DIR: &str = "./generated";
const DEFAULT_ARTIFACT_BASE_URL: &str = "/generated";
const DEFAULT_CONVERTER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TEMPLATE_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Which external utility turns rendered documents into PDFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterKind {
    Typst,
    LibreOffice,
}

impl FromStr for ConverterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "typst" => Ok(ConverterKind::Typst),
            "libreoffice" | "soffice" => Ok(ConverterKind::LibreOffice),
            other => Err(format!("unknown converter '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub template_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub artifact_base_url: String,
    pub converter: ConverterKind,
    pub converter_program: Option<String>,
    pub converter_timeout: Duration,
    pub registration_format: RegistrationFormat,
    pub template_cache_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            artifact_base_url: DEFAULT_ARTIFACT_BASE_URL.to_string(),
            converter: ConverterKind::Typst,
            converter_program: None,
            converter_timeout: Duration::from_secs(DEFAULT_CONVERTER_TIMEOUT_SECS),
            registration_format: RegistrationFormat::default(),
            template_cache_ttl: Duration::from_secs(DEFAULT_TEMPLATE_CACHE_TTL_SECS),
        }
    }
}

impl PipelineConfig {
    /// Read configuration from the environment, loading `.env` first.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let converter = match env::var("CONVERTER") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.converter,
        };

        let registration_format = RegistrationFormat {
            prefix: env::var("REGISTRATION_PREFIX")
                .unwrap_or_else(|_| defaults.registration_format.prefix.clone()),
            width: parse_var("REGISTRATION_WIDTH", defaults.registration_format.width)?,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            template_dir: path_var("TEMPLATE_DIR", DEFAULT_TEMPLATE_DIR),
            artifact_dir: path_var("ARTIFACT_DIR", DEFAULT_ARTIFACT_DIR),
            artifact_base_url: env::var("ARTIFACT_BASE_URL").unwrap_or_else(|_| {
                log::warn!(
                    "ARTIFACT_BASE_URL not set, using default: {}",
                    DEFAULT_ARTIFACT_BASE_URL
                );
                DEFAULT_ARTIFACT_BASE_URL.to_string()
            }),
            converter,
            converter_program: env::var("CONVERTER_PROGRAM").ok(),
            converter_timeout: Duration::from_secs(parse_var(
                "CONVERTER_TIMEOUT_SECS",
                DEFAULT_CONVERTER_TIMEOUT_SECS,
            )?),
            registration_format,
            template_cache_ttl: Duration::from_secs(parse_var(
                "TEMPLATE_CACHE_TTL_SECS",
                DEFAULT_TEMPLATE_CACHE_TTL_SECS,
            )?),
        })
    }

    /// Build the converter selected by `CONVERTER`.
    pub fn build_converter(&self) -> ProcessConverter {
        let converter = match self.converter {
            ConverterKind::Typst => ProcessConverter::typst(self.converter_timeout),
            ConverterKind::LibreOffice => ProcessConverter::libreoffice(self.converter_timeout),
        };
        match &self.converter_program {
            Some(program) => converter.with_program(program.clone()),
            None => converter,
        }
    }
}

fn path_var(name: &str, default: &str) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or_else(|_| {
        log::warn!("{} not set, using default path: {}", name, default);
        PathBuf::from(default)
    })
}

fn parse_var<T>(name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid value for {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
