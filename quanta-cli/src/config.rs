use anyhow::{Context, Result};
use quanta_core::{SchedulerConfig, parse_boundary, parse_timezone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::state::ensure_quanta_home;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub reset: ResetSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub default_quantum_minutes: u32,
    /// IANA zone name used for deadlines and the daily boundary.
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetSection {
    /// Local "HH:MM" at which daily routines come back.
    pub daily_boundary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub tick_seconds: u64,
    pub sweep_seconds: u64,
    /// Minutes offered when a quantum runs out and the answer is just "e".
    pub extend_minutes: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            default_quantum_minutes: 60,
            timezone: "America/Chicago".to_string(),
        }
    }
}

impl Default for ResetSection {
    fn default() -> Self {
        Self {
            daily_boundary: "05:00".to_string(),
        }
    }
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            sweep_seconds: 60,
            extend_minutes: 15,
        }
    }
}

impl Config {
    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        if self.scheduler.default_quantum_minutes == 0 {
            anyhow::bail!("scheduler.default_quantum_minutes must be at least 1");
        }
        Ok(SchedulerConfig {
            default_quantum_minutes: self.scheduler.default_quantum_minutes,
            timezone: parse_timezone(&self.scheduler.timezone)?,
            daily_boundary: parse_boundary(&self.reset.daily_boundary)?,
        })
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(ensure_quanta_home()?.join("config.toml"))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(p: &Path) -> Result<Config> {
    if !p.exists() {
        return Ok(Config::default());
    }
    let s = fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?;
    toml::from_str(&s).context("parse config.toml")
}

pub fn save_config_to(p: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(p, s).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

pub fn init_config() -> Result<()> {
    let p = config_path()?;
    if p.exists() {
        println!("Config already exists: {}", p.display());
        return Ok(());
    }
    save_config_to(&p, &Config::default())?;
    println!("Wrote {}", p.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("[scheduler]\ntimezone = \"UTC\"\n").unwrap();
        assert_eq!(cfg.scheduler.default_quantum_minutes, 60);
        assert_eq!(cfg.scheduler.timezone, "UTC");
        assert_eq!(cfg.reset.daily_boundary, "05:00");
        assert_eq!(cfg.run.tick_seconds, 1);
    }

    #[test]
    fn converts_to_scheduler_config() {
        let cfg = Config::default();
        let sc = cfg.scheduler_config().unwrap();
        assert_eq!(sc.default_quantum_minutes, 60);
        assert_eq!(sc.timezone, chrono_tz::America::Chicago);
        assert_eq!(sc.daily_boundary, NaiveTime::from_hms_opt(5, 0, 0).unwrap());
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut cfg = Config::default();
        cfg.reset.daily_boundary = "25:00".into();
        assert!(cfg.scheduler_config().is_err());

        let mut cfg = Config::default();
        cfg.scheduler.timezone = "Mars/Olympus".into();
        assert!(cfg.scheduler_config().is_err());

        let mut cfg = Config::default();
        cfg.scheduler.default_quantum_minutes = 0;
        assert!(cfg.scheduler_config().is_err());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.run.sweep_seconds = 30;
        save_config_to(&path, &cfg).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), cfg);
    }
}
