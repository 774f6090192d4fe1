use crate::error::BoxError;
use crate::model::{BoxTemplate, TemplateSource};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const BOX_TEMPLATE_KIND: &str = "box/v1";

#[derive(Debug, Clone)]
pub struct LoadedTemplate {
    pub template: BoxTemplate,
    pub source: TemplateSource,
}

/// Resolves `reference` as a file path first, then as a template name
/// inside `template_dir`.
pub fn load(reference: &str, template_dir: &Path) -> Result<LoadedTemplate> {
    let path = resolve_path(reference, template_dir).ok_or_else(|| {
        BoxError::invalid_template(format!(
            "template '{reference}' not found in {}",
            template_dir.display()
        ))
    })?;
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    let template = parse(&raw).with_context(|| format!("failed to load template {}", path.display()))?;
    let absolute = path.canonicalize().unwrap_or(path);

    Ok(LoadedTemplate {
        template,
        source: TemplateSource::Local {
            path: absolute.display().to_string(),
        },
    })
}

pub fn parse(raw: &str) -> Result<BoxTemplate> {
    let template = serde_yaml::from_str::<BoxTemplate>(raw)
        .map_err(|error| BoxError::invalid_template(error.to_string()))?;
    validate(&template)?;
    Ok(template)
}

fn validate(template: &BoxTemplate) -> Result<()> {
    if template.kind != BOX_TEMPLATE_KIND {
        return Err(BoxError::invalid_template(format!(
            "unsupported kind '{}', expected {BOX_TEMPLATE_KIND}",
            template.kind
        ))
        .into());
    }
    if template.name.trim().is_empty() {
        return Err(BoxError::invalid_template("name is required").into());
    }
    if template.image.repository.trim().is_empty() {
        return Err(BoxError::invalid_template("image repository is required").into());
    }
    template
        .network_ports(true)
        .map_err(|error| BoxError::invalid_template(format!("{error:#}")))?;
    template
        .env_pairs()
        .map_err(|error| BoxError::invalid_template(format!("{error:#}")))?;
    Ok(())
}

fn resolve_path(reference: &str, template_dir: &Path) -> Option<PathBuf> {
    let direct = PathBuf::from(reference);
    if direct.is_file() {
        return Some(direct);
    }

    ["yml", "yaml"]
        .into_iter()
        .map(|extension| template_dir.join(format!("{reference}.{extension}")))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::{load, parse};
    use crate::error::BoxError;
    use crate::model::TemplateSource;
    use std::fs;

    const ALPINE: &str = r#"
kind: box/v1
name: alpine
tags:
  - test
image:
  repository: hckops/alpine
shell: /bin/sh
network:
  ports:
    - tty:7681
    - virtual-vpn:1194
env:
  - TTYD_USERNAME=hck
"#;

    #[test]
    fn parses_with_defaults() {
        let template = parse(ALPINE).unwrap();
        assert_eq!(template.name, "alpine");
        assert_eq!(template.image.version, "latest");
        assert_eq!(template.image_name(), "hckops/alpine:latest");
        assert_eq!(template.network.ports.len(), 2);
        assert_eq!(template.env_pairs().unwrap()[0].key, "TTYD_USERNAME");
    }

    #[test]
    fn rejects_wrong_kind_and_bad_ports() {
        let error = parse(&ALPINE.replace("box/v1", "lab/v1")).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BoxError>(),
            Some(BoxError::InvalidTemplate { .. })
        ));

        let error = parse(&ALPINE.replace("tty:7681", "tty:http")).unwrap_err();
        assert!(error.to_string().starts_with("invalid template"));
    }

    #[test]
    fn loads_by_name_from_template_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpine.yml"), ALPINE).unwrap();

        let loaded = load("alpine", dir.path()).unwrap();
        assert_eq!(loaded.template.name, "alpine");
        let TemplateSource::Local { path } = loaded.source else {
            panic!("expected local provenance");
        };
        assert!(path.ends_with("alpine.yml"));

        let direct = dir.path().join("alpine.yml");
        assert!(load(direct.to_str().unwrap(), dir.path()).is_ok());
        assert!(load("parrot", dir.path()).is_err());
    }
}
