//! Pre-model screening rules.
//!
//! Fast regex checks run on each content unit before evaluation:
//! - prohibited-content keywords (SHAFT, lead generation, debt relief)
//! - public URL shorteners
//! - sample messages missing opt-out language
//! - sample messages that never name the brand
//!
//! Screening never decides a verdict. Its notes are handed to the model as
//! hints and copied into the finding when the model omits them.

use regex::Regex;
use tracing::{debug, warn};

use crate::model::{ContentUnit, UnitKind};

/// A single screening observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenNote {
    pub rule: String,
    pub note: String,
}

/// A rule that flags a unit when its pattern is present.
#[derive(Debug, Clone)]
pub struct FlagRule {
    pub name: String,
    pub regex: Regex,
    /// Unit kinds this rule applies to; empty means all.
    pub kinds: Vec<UnitKind>,
    pub note: String,
}

/// A rule that flags a unit when its pattern is absent.
#[derive(Debug, Clone)]
pub struct RequireRule {
    pub name: String,
    pub regex: Regex,
    pub kinds: Vec<UnitKind>,
    pub note: String,
}

fn applies(kinds: &[UnitKind], kind: UnitKind) -> bool {
    kinds.is_empty() || kinds.contains(&kind)
}

fn compile(name: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(rule = name, error = %e, "Invalid screening pattern, rule skipped");
            None
        }
    }
}

/// Regex screening engine.
pub struct ScreeningRules {
    flag_rules: Vec<FlagRule>,
    require_rules: Vec<RequireRule>,
    check_brand_mention: bool,
}

impl ScreeningRules {
    /// Built-in carrier screening rules.
    pub fn default_rules() -> Self {
        let flags: [(&str, &str, &[UnitKind], &str); 5] = [
            (
                "shaft_content",
                r"(?i)\b(sex|xxx|escort|hate|beer|wine|liquor|vodka|alcohol|firearms?|guns?|ammo|ammunition|tobacco|cigarettes?|vape|vaping|cannabis|marijuana|cbd|thc)\b",
                &[],
                "mentions SHAFT-category content (sex, hate, alcohol, firearms, tobacco/cannabis)",
            ),
            (
                "high_risk_financial",
                r"(?i)\b(debt (relief|forgiveness|consolidation)|payday loans?|credit repair|get rich|crypto(currency)? (giveaway|signals))\b",
                &[],
                "mentions high-risk financial services",
            ),
            (
                "lead_generation",
                r"(?i)\b(lead generation|leads for sale|affiliate offers?|third[- ]party marketing)\b",
                &[],
                "suggests third-party lead generation",
            ),
            (
                "url_shortener",
                r"(?i)\b(bit\.ly|tinyurl\.com|goo\.gl|ow\.ly|t\.co|is\.gd|buff\.ly|rebrand\.ly)/",
                &[UnitKind::Message, UnitKind::Document],
                "uses a public URL shortener",
            ),
            (
                "consent_as_condition",
                r"(?i)\b(must (agree|consent) to (receive )?(texts|sms|messages)|consent is required to purchase)\b",
                &[UnitKind::Document, UnitKind::Image],
                "makes messaging consent a condition of purchase",
            ),
        ];

        let requires: [(&str, &str, &[UnitKind], &str); 1] = [(
            "opt_out_language",
            r"(?i)\b(stop|unsubscribe|opt[- ]?out|cancel|end|quit)\b",
            &[UnitKind::Message],
            "sample message has no opt-out instruction (e.g. \"Reply STOP to unsubscribe\")",
        )];

        let flag_rules = flags
            .iter()
            .filter_map(|(name, pattern, kinds, note)| {
                compile(name, pattern).map(|regex| FlagRule {
                    name: (*name).to_string(),
                    regex,
                    kinds: kinds.to_vec(),
                    note: (*note).to_string(),
                })
            })
            .collect();
        let require_rules = requires
            .iter()
            .filter_map(|(name, pattern, kinds, note)| {
                compile(name, pattern).map(|regex| RequireRule {
                    name: (*name).to_string(),
                    regex,
                    kinds: kinds.to_vec(),
                    note: (*note).to_string(),
                })
            })
            .collect();

        Self {
            flag_rules,
            require_rules,
            check_brand_mention: true,
        }
    }

    /// Create an empty rules engine (for testing).
    pub fn empty() -> Self {
        Self {
            flag_rules: Vec::new(),
            require_rules: Vec::new(),
            check_brand_mention: false,
        }
    }

    /// Add a custom flag rule.
    pub fn add_flag_rule(
        &mut self,
        name: &str,
        pattern: &str,
        kinds: &[UnitKind],
        note: &str,
    ) -> Result<(), regex::Error> {
        self.flag_rules.push(FlagRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
            kinds: kinds.to_vec(),
            note: note.into(),
        });
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.flag_rules.len() + self.require_rules.len()
    }

    /// Screen a unit. `brand_name` is checked for in sample messages.
    pub fn screen(&self, unit: &ContentUnit, brand_name: &str) -> Vec<ScreenNote> {
        let mut notes = Vec::new();

        for rule in &self.flag_rules {
            if applies(&rule.kinds, unit.kind) && rule.regex.is_match(&unit.content) {
                notes.push(ScreenNote {
                    rule: rule.name.clone(),
                    note: rule.note.clone(),
                });
            }
        }

        for rule in &self.require_rules {
            if applies(&rule.kinds, unit.kind) && !rule.regex.is_match(&unit.content) {
                notes.push(ScreenNote {
                    rule: rule.name.clone(),
                    note: rule.note.clone(),
                });
            }
        }

        let brand = brand_name.trim();
        if self.check_brand_mention && unit.kind == UnitKind::Message && !brand.is_empty() {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(brand));
            if let Some(re) = compile("brand_identification", &pattern)
                && !re.is_match(&unit.content)
            {
                notes.push(ScreenNote {
                    rule: "brand_identification".into(),
                    note: format!("sample message does not identify the brand \"{brand}\""),
                });
            }
        }

        if !notes.is_empty() {
            debug!(unit_id = %unit.id, count = notes.len(), "Screening flagged unit");
        }
        notes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message(content: &str) -> ContentUnit {
        ContentUnit::new(Uuid::new_v4(), UnitKind::Message, "web_form", content)
    }

    fn rules_hit(notes: &[ScreenNote]) -> Vec<&str> {
        notes.iter().map(|n| n.rule.as_str()).collect()
    }

    #[test]
    fn default_rules_all_compile() {
        assert_eq!(ScreeningRules::default_rules().rule_count(), 6);
    }

    #[test]
    fn compliant_message_has_no_notes() {
        let notes = ScreeningRules::default_rules().screen(
            &message("Acme Dental: your cleaning is tomorrow at 3pm. Reply STOP to opt out."),
            "Acme Dental",
        );
        assert!(notes.is_empty(), "unexpected notes: {notes:?}");
    }

    #[test]
    fn flags_missing_opt_out_and_brand() {
        let notes = ScreeningRules::default_rules()
            .screen(&message("Your appointment is tomorrow."), "Acme Dental");
        let hit = rules_hit(&notes);
        assert!(hit.contains(&"opt_out_language"));
        assert!(hit.contains(&"brand_identification"));
    }

    #[test]
    fn flags_shaft_and_shortener() {
        let notes = ScreeningRules::default_rules().screen(
            &message("Acme: 2-for-1 vodka tonight! bit.ly/xyz Reply STOP to end"),
            "Acme",
        );
        let hit = rules_hit(&notes);
        assert!(hit.contains(&"shaft_content"));
        assert!(hit.contains(&"url_shortener"));
    }

    #[test]
    fn require_rules_skip_other_kinds() {
        let doc = ContentUnit::new(
            Uuid::new_v4(),
            UnitKind::Document,
            "privacy_policy",
            "We never share mobile numbers.",
        );
        assert!(ScreeningRules::default_rules().screen(&doc, "Acme").is_empty());
    }

    #[test]
    fn custom_rule() {
        let mut rules = ScreeningRules::empty();
        rules
            .add_flag_rule("sweepstakes", r"(?i)\bsweepstakes\b", &[], "sweepstakes promotion")
            .unwrap();
        let notes = rules.screen(&message("Enter our SWEEPSTAKES"), "Acme");
        assert_eq!(rules_hit(&notes), vec!["sweepstakes"]);
        assert!(rules.add_flag_rule("bad", "(", &[], "x").is_err());
    }
}
