//! Workspace layout and phase-artifact persistence.
//!
//! Each phase writes a self-describing JSONL (or JSON) artifact under the run
//! workspace; a later phase, or a resumed run, reads it back without
//! re-deriving anything.

use std::fs::OpenOptions;
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::formats::{FilterCriteria, PhaseState, SiteSeed};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn create(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create workspace dir: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn sites_path(&self) -> PathBuf {
        self.root.join("sites.jsonl")
    }

    pub fn descriptors_path(&self) -> PathBuf {
        self.root.join("descriptors.jsonl")
    }

    pub fn records_path(&self) -> PathBuf {
        self.root.join("records.jsonl")
    }

    pub fn filtered_path(&self) -> PathBuf {
        self.root.join("filtered.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.json")
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn load_state(&self) -> anyhow::Result<PhaseState> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(PhaseState::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("read phase state: {}", path.display()))?;
        serde_json::from_str(&contents).context("parse phase state")
    }

    pub fn save_state(&self, state: &PhaseState) -> anyhow::Result<()> {
        let path = self.state_path();
        let json = serde_json::to_string_pretty(state).context("serialize phase state")?;
        std::fs::write(&path, json).with_context(|| format!("write phase state: {}", path.display()))
    }
}

/// Read a JSONL artifact, skipping blank lines.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("open artifact: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("read artifact line: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value =
            serde_json::from_str(&line).with_context(|| format!("parse artifact line: {}", path.display()))?;
        out.push(value);
    }
    Ok(out)
}

/// Write a whole JSONL artifact, replacing any previous version.
pub fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create artifact: {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);

    for item in items {
        serde_json::to_writer(&mut writer, item).context("serialize artifact line")?;
        writer.write_all(b"\n").context("write artifact newline")?;
    }
    writer.flush().context("flush artifact")
}

/// Append items to a JSONL artifact, creating it on first use. This is the
/// incremental-save path: records land on disk as soon as a site finishes.
pub fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open artifact for append: {}", path.display()))?;

    for item in items {
        serde_json::to_writer(&mut file, item).context("serialize artifact line")?;
        file.write_all(b"\n").context("write artifact newline")?;
    }
    file.flush().context("flush artifact")
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize artifact")?;
    std::fs::write(path, json).with_context(|| format!("write artifact: {}", path.display()))
}

/// Seed sites, one `{name, site_url, department_code?}` object per line.
pub fn load_seeds(path: &Path) -> anyhow::Result<Vec<SiteSeed>> {
    let seeds: Vec<SiteSeed> = read_jsonl(path)?;
    if seeds.is_empty() {
        anyhow::bail!("seeds file is empty: {}", path.display());
    }
    Ok(seeds)
}

/// Filter criteria from a YAML file; absent path means the default profile.
pub fn load_criteria(path: Option<&Path>) -> anyhow::Result<FilterCriteria> {
    let Some(path) = path else {
        return Ok(FilterCriteria::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read criteria: {}", path.display()))?;
    serde_yaml::from_str(&contents).context("parse criteria yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::Phase;

    #[test]
    fn jsonl_round_trip_and_append() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("records.jsonl");

        let seeds = vec![
            SiteSeed {
                name: "Étude A".to_owned(),
                site_url: "http://a.test/".to_owned(),
                department_code: Some("75".to_owned()),
            },
            SiteSeed {
                name: "Étude B".to_owned(),
                site_url: "http://b.test/".to_owned(),
                department_code: None,
            },
        ];
        write_jsonl(&path, &seeds)?;
        append_jsonl(&path, &seeds[..1])?;

        let loaded: Vec<SiteSeed> = read_jsonl(&path)?;
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].name, "Étude A");
        Ok(())
    }

    #[test]
    fn phase_state_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let workspace = Workspace::create(temp.path().join("run"))?;

        let mut state = workspace.load_state()?;
        assert!(!state.is_completed(Phase::Discover));

        state.mark_completed(
            Phase::Discover,
            workspace.sites_path().to_string_lossy().to_string(),
        );
        workspace.save_state(&state)?;

        let reloaded = workspace.load_state()?;
        assert!(reloaded.is_completed(Phase::Discover));
        assert!(!reloaded.is_completed(Phase::Extract));
        Ok(())
    }

    #[test]
    fn criteria_default_when_no_file_given() -> anyhow::Result<()> {
        let criteria = load_criteria(None)?;
        assert!(criteria.sectors.contains(&"informatique".to_owned()));
        assert_eq!(criteria.departments.len(), 8);
        Ok(())
    }

    #[test]
    fn criteria_yaml_is_parsed() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("criteria.yaml");
        std::fs::write(
            &path,
            "sectors: [informatique]\ndepartments: ['75', '92']\nmin_price: 50000\nmax_price: 500000\n",
        )?;
        let criteria = load_criteria(Some(&path))?;
        assert_eq!(criteria.min_price, Some(50_000));
        assert_eq!(criteria.departments, vec!["75", "92"]);
        Ok(())
    }
}
