//! Conversational grounding supplied at session start

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// A family member the companion may talk about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub name: String,
    pub relation: String,
}

/// A remembered event or fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
    pub description: String,
}

/// Immutable grounding data for one conversation
///
/// Read once when the handshake is built; never mutated during a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    /// How the companion addresses the user
    pub user_name: String,

    #[serde(default)]
    pub family: Vec<FamilyMember>,

    #[serde(default)]
    pub memories: Vec<MemoryFact>,
}

impl SessionContext {
    /// Load a context from a JSON profile file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let context: Self = serde_json::from_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            family = context.family.len(),
            memories = context.memories.len(),
            "loaded session context"
        );
        Ok(context)
    }

    /// Build the system instruction sent with the handshake
    ///
    /// Deterministic: the same context always yields the same text.
    #[must_use]
    pub fn system_instruction(&self) -> String {
        let name = if self.user_name.trim().is_empty() {
            "the user"
        } else {
            self.user_name.trim()
        };

        let mut text = format!(
            "You are a warm, patient companion helping {name} recall their life and the people \
             in it. Speak slowly and kindly, use short sentences, and gently encourage them to \
             share more.\n\nFamily members:\n"
        );

        if self.family.is_empty() {
            text.push_str("- (none recorded)\n");
        }
        for member in &self.family {
            let _ = writeln!(text, "- {} ({})", member.name, member.relation);
        }

        text.push_str("\nMemories:\n");
        if self.memories.is_empty() {
            text.push_str("- (none recorded)\n");
        }
        for memory in &self.memories {
            match memory.date.as_deref().filter(|d| !d.trim().is_empty()) {
                Some(date) => {
                    let _ = writeln!(text, "- {} [{date}]: {}", memory.title, memory.description);
                }
                None => {
                    let _ = writeln!(text, "- {}: {}", memory.title, memory.description);
                }
            }
        }

        let _ = write!(
            text,
            "\nOnly mention people and memories from the lists above. Never invent names, \
             relationships, dates, or events that are not listed. If you do not know something, \
             say so kindly and ask {name} to tell you about it."
        );

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anna() -> SessionContext {
        SessionContext {
            user_name: "Margaret".to_string(),
            family: vec![FamilyMember {
                name: "Anna".to_string(),
                relation: "Wife".to_string(),
            }],
            memories: vec![],
        }
    }

    #[test]
    fn test_family_bullet() {
        let text = anna().system_instruction();
        assert!(text.contains("- Anna (Wife)"));
        assert!(text.contains("Margaret"));
        assert!(text.contains("Memories:\n- (none recorded)"));
        assert!(text.contains("Never invent"));
    }

    #[test]
    fn test_memory_bullets() {
        let mut context = anna();
        context.memories = vec![
            MemoryFact {
                title: "Wedding".to_string(),
                date: Some("1972".to_string()),
                description: "Married in Lisbon".to_string(),
            },
            MemoryFact {
                title: "First dog".to_string(),
                date: None,
                description: "A beagle called Rex".to_string(),
            },
        ];

        let text = context.system_instruction();
        assert!(text.contains("- Wedding [1972]: Married in Lisbon"));
        assert!(text.contains("- First dog: A beagle called Rex"));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(anna().system_instruction(), anna().system_instruction());
    }

    #[test]
    fn test_blank_name() {
        let text = SessionContext::default().system_instruction();
        assert!(text.contains("helping the user recall"));
        assert!(text.contains("Family members:\n- (none recorded)"));
    }

    #[test]
    fn test_parse_profile_json() {
        let json = r#"{
            "userName": "Joe",
            "family": [{"name": "Anna", "relation": "Wife"}],
            "memories": [{"title": "Trip", "description": "Went to Rome"}]
        }"#;
        let context: SessionContext = serde_json::from_str(json).unwrap();
        assert_eq!(context.user_name, "Joe");
        assert_eq!(context.memories[0].date, None);
    }
}
