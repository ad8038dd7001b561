//! Base templates: the starting capability set onto which a request composes.

use serde::{Deserialize, Serialize};

use super::capability::{is_valid_name, CapabilityRef, RefDocument};

/// A base template.
///
/// ```yaml
/// template:
///   name: advisor
///   description: "Advisory agent baseline"
///   capabilities:
///     - memory-management
///     - { name: domain-knowledge, version: "^1" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Capabilities every composition on this template starts with.
    #[serde(default)]
    pub capabilities: Vec<CapabilityRef>,
}

impl Template {
    /// An empty template, used when a request names a template the registry
    /// does not know.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn from_document(doc: TemplateDocument) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();
        let name = match doc.name {
            Some(n) if is_valid_name(&n) => n,
            Some(n) => {
                problems.push(format!("template name '{}' is not lowercase-hyphen", n));
                n
            }
            None => {
                problems.push("missing required field 'name'".to_string());
                String::new()
            }
        };

        let mut capabilities: Vec<CapabilityRef> = Vec::new();
        for entry in doc.capabilities {
            match entry.into_ref("capabilities") {
                Ok(r) if capabilities.iter().any(|c| c.name == r.name) => {
                    problems.push(format!("capabilities: '{}' listed more than once", r.name))
                }
                Ok(r) => capabilities.push(r),
                Err(e) => problems.push(e),
            }
        }

        if problems.is_empty() {
            Ok(Self {
                name,
                description: doc.description,
                capabilities,
            })
        } else {
            Err(problems)
        }
    }
}

/// A template as written, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<RefDocument>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_from_document() {
        let doc: TemplateDocument = serde_yaml::from_str(
            r#"
name: advisor
capabilities:
  - memory-management
  - { name: domain-knowledge, version: "^1" }
"#,
        )
        .unwrap();
        let template = Template::from_document(doc).unwrap();
        assert_eq!(template.name, "advisor");
        assert_eq!(template.capabilities.len(), 2);
        assert!(template.capabilities[0].version.is_any());
        assert!(!template.capabilities[1].version.is_any());
    }

    #[test]
    fn test_template_rejects_duplicates() {
        let doc: TemplateDocument =
            serde_yaml::from_str("name: advisor\ncapabilities: [a, a]").unwrap();
        let problems = Template::from_document(doc).unwrap_err();
        assert_eq!(problems, vec!["capabilities: 'a' listed more than once"]);
    }
}
