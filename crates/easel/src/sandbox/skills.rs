//! Read-only access to the skills documentation directory.
//!
//! A skill is either `<dir>/<name>.md` or `<dir>/<name>/SKILL.md`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::CapabilityError;

static SKILL_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").ok());

fn is_valid_name(name: &str) -> bool {
    SKILL_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// One entry returned by `listSkills`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillSummary {
    /// Name to pass to `readSkill`.
    pub name: String,
    /// First line of the document, or its front-matter description.
    pub description: String,
}

fn skill_path(dir: &Path, name: &str) -> Result<PathBuf, CapabilityError> {
    if !is_valid_name(name) {
        return Err(CapabilityError::InvalidArgument(format!(
            "invalid skill name {name:?}"
        )));
    }

    let flat = dir.join(format!("{name}.md"));
    if flat.is_file() {
        return Ok(flat);
    }
    let nested = dir.join(name).join("SKILL.md");
    if nested.is_file() {
        return Ok(nested);
    }
    Err(CapabilityError::NotFound(format!("skill {name}")))
}

/// Every skill in `dir`, sorted by name.
pub async fn list_skills(dir: Option<&Path>) -> Result<Vec<SkillSummary>, CapabilityError> {
    let Some(dir) = dir else {
        return Ok(Vec::new());
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut skills = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = if entry.file_type().await?.is_dir() {
            if !path.join("SKILL.md").is_file() {
                continue;
            }
            entry.file_name().to_string_lossy().into_owned()
        } else {
            match path.extension().and_then(|e| e.to_str()) {
                Some("md") => path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                _ => continue,
            }
        };
        if !is_valid_name(&name) {
            continue;
        }

        let text = tokio::fs::read_to_string(skill_path(dir, &name)?).await?;
        skills.push(SkillSummary {
            description: describe(&text),
            name,
        });
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills.dedup_by(|a, b| a.name == b.name);
    Ok(skills)
}

/// Full text of one skill.
pub async fn read_skill(dir: Option<&Path>, name: &str) -> Result<String, CapabilityError> {
    let dir = dir.ok_or_else(|| CapabilityError::NotFound(format!("skill {name}")))?;
    let path = skill_path(dir, name)?;
    Ok(tokio::fs::read_to_string(path).await?)
}

fn describe(text: &str) -> String {
    let mut lines = text.lines().map(str::trim);

    if text.trim_start().starts_with("---") {
        lines.next();
        for line in lines.by_ref() {
            if line == "---" {
                break;
            }
            if let Some(description) = line.strip_prefix("description:") {
                return description.trim().trim_matches('"').to_string();
            }
        }
    }

    lines
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn skills_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("charts.md"), "# Charting\n\nUse setChart.")
            .await
            .unwrap();
        tokio::fs::create_dir(dir.path().join("maps")).await.unwrap();
        tokio::fs::write(
            dir.path().join("maps").join("SKILL.md"),
            "---\nname: maps\ndescription: \"Plot coordinates\"\n---\nBody",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();
        dir
    }

    #[tokio::test]
    async fn test_list_skills() {
        let dir = skills_dir().await;
        let skills = list_skills(Some(dir.path())).await.unwrap();

        assert_eq!(
            skills,
            vec![
                SkillSummary {
                    name: "charts".into(),
                    description: "Charting".into()
                },
                SkillSummary {
                    name: "maps".into(),
                    description: "Plot coordinates".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_read_skill() {
        let dir = skills_dir().await;

        let text = read_skill(Some(dir.path()), "maps").await.unwrap();
        assert!(text.ends_with("Body"));

        assert!(matches!(
            read_skill(Some(dir.path()), "missing").await,
            Err(CapabilityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_skill_rejects_bad_names() {
        let dir = skills_dir().await;

        for name in ["../secret", "a/b", "", "x".repeat(65).as_str()] {
            assert!(
                matches!(
                    read_skill(Some(dir.path()), name).await,
                    Err(CapabilityError::InvalidArgument(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_no_skills_dir() {
        assert!(list_skills(None).await.unwrap().is_empty());
        assert!(read_skill(None, "charts").await.is_err());
    }
}
