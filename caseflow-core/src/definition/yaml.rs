use super::validate::validate_definition;
use super::CaseDefinition;
use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Parse a YAML string into a prepared CaseDefinition.
///
/// Validation is NOT performed here. Call `validate_definition()` or use
/// `load_case_yaml()`, which rejects invalid models.
pub fn parse_case_yaml(yaml_str: &str) -> Result<CaseDefinition> {
    let mut def: CaseDefinition = serde_yaml::from_str(yaml_str)?;
    def.prepare();
    Ok(def)
}

/// Parse and validate. All rule violations are reported together.
pub fn load_case_yaml(yaml_str: &str) -> Result<CaseDefinition> {
    let def = parse_case_yaml(yaml_str)?;
    let errors = validate_definition(&def);
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(anyhow!("Case definition '{}' is invalid: {}", def.key, joined));
    }
    Ok(def)
}

/// Load every `*.yaml` / `*.yml` file in a directory.
pub fn load_case_dir(dir: &Path) -> Result<Vec<CaseDefinition>> {
    let mut defs = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Reading {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !is_yaml {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let def = load_case_yaml(&content).with_context(|| format!("Parsing {}", path.display()))?;
        defs.push(def);
    }
    Ok(defs)
}
