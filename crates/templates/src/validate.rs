use burrow_common::{Error, Result};

use crate::types::TemplateKind;

/// Validate template content for its kind.
///
/// Instructions and Command accept any non-empty text. Skill content must
/// carry a parseable YAML frontmatter block. MCP server content must be a
/// JSON object containing both `command` and `args`.
pub fn validate_content(kind: TemplateKind, content: &str) -> Result<()> {
    match kind {
        TemplateKind::Instructions | TemplateKind::Command => {
            if content.trim().is_empty() {
                return Err(Error::validation(format!(
                    "{} template content cannot be empty",
                    kind.as_str()
                )));
            }
            Ok(())
        },
        TemplateKind::Skill => {
            let frontmatter = split_frontmatter(content)?;
            serde_yaml::from_str::<serde_yaml::Value>(&frontmatter)
                .map_err(|e| Error::validation(format!("invalid skill frontmatter: {e}")))?;
            Ok(())
        },
        TemplateKind::McpServer => {
            let value: serde_json::Value = serde_json::from_str(content)
                .map_err(|e| Error::validation(format!("MCP server spec is not valid JSON: {e}")))?;
            let obj = value
                .as_object()
                .ok_or_else(|| Error::validation("MCP server spec must be a JSON object"))?;
            for key in ["command", "args"] {
                if !obj.contains_key(key) {
                    return Err(Error::validation(format!(
                        "MCP server spec is missing required field '{key}'"
                    )));
                }
            }
            Ok(())
        },
    }
}

/// Extract the YAML frontmatter between the leading `---` fences.
fn split_frontmatter(content: &str) -> Result<String> {
    let trimmed = content.trim_start();
    let Some(after_open) = trimmed.strip_prefix("---") else {
        return Err(Error::validation(
            "skill content must start with YAML frontmatter delimited by ---",
        ));
    };
    let close = after_open
        .find("\n---")
        .ok_or_else(|| Error::validation("skill frontmatter is missing its closing ---"))?;
    Ok(after_open[..close].trim().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn instructions_reject_empty() {
        assert!(validate_content(TemplateKind::Instructions, "  \n").is_err());
        assert!(validate_content(TemplateKind::Instructions, "# hi").is_ok());
    }

    #[test]
    fn command_reject_empty() {
        assert!(validate_content(TemplateKind::Command, "").is_err());
        assert!(validate_content(TemplateKind::Command, "echo hi").is_ok());
    }

    #[test]
    fn skill_requires_frontmatter() {
        assert!(validate_content(TemplateKind::Skill, "# just markdown").is_err());
        assert!(validate_content(TemplateKind::Skill, "---\nname: x\n--").is_err());

        let ok = "---\nallowed_tools:\n  - Read\n---\n# s";
        assert!(validate_content(TemplateKind::Skill, ok).is_ok());
    }

    #[test]
    fn skill_rejects_unparseable_yaml() {
        let bad = "---\nname: [unclosed\n---\nbody";
        assert!(validate_content(TemplateKind::Skill, bad).is_err());
    }

    #[test]
    fn mcp_requires_command_and_args() {
        assert!(validate_content(TemplateKind::McpServer, "not json").is_err());
        assert!(validate_content(TemplateKind::McpServer, "[1,2]").is_err());
        assert!(validate_content(TemplateKind::McpServer, r#"{"command": "npx"}"#).is_err());
        assert!(validate_content(TemplateKind::McpServer, r#"{"args": []}"#).is_err());
        assert!(
            validate_content(TemplateKind::McpServer, r#"{"command": "npx", "args": ["-y"]}"#)
                .is_ok()
        );
    }
}
