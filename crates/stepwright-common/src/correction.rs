//! The correction document: steps and fields as edited by a human.
//!
//! Everything here is permissive on input. Missing keys fall back to
//! defaults so that a half-edited draft coming from a debounced autosave
//! always deserializes; structural validation happens only when the draft is
//! confirmed.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role of a page in a multi-page flow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormType {
    Login,
    Intermediate,
    #[default]
    Target,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Intermediate => "intermediate",
            Self::Target => "target",
        }
    }
}

impl FromStr for FormType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(Self::Login),
            "intermediate" => Ok(Self::Intermediate),
            "target" => Ok(Self::Target),
            _ => Err(format!("Invalid form type: {}", s)),
        }
    }
}

fn default_field_type() -> String {
    "text".to_string()
}

/// One input on a page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Field {
    #[serde(default)]
    pub field_name: String,
    #[serde(default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub field_selector: String,
    #[serde(default)]
    pub field_purpose: Option<String>,
    /// Plaintext while drafting. Sealed on confirmation when `is_sensitive`.
    #[serde(default)]
    pub preset_value: Option<String>,
    #[serde(default)]
    pub is_sensitive: bool,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_file_upload: bool,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub sort_order: u32,
}

impl Field {
    /// True when the field carries a non-empty value that must be sealed at rest.
    pub fn needs_sealing(&self) -> bool {
        self.is_sensitive && self.preset_value.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// One page/form in the flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(default)]
    pub step_order: u32,
    #[serde(default)]
    pub depends_on_step_order: Option<u32>,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub form_type: FormType,
    #[serde(default)]
    pub form_selector: String,
    #[serde(default)]
    pub submit_selector: Option<String>,
    /// Pause before submit so a human can intervene.
    #[serde(default)]
    pub human_breakpoint: bool,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Step {
    pub fn is_login(&self) -> bool {
        self.form_type == FormType::Login
    }
}

/// The working, unconfirmed document for one editable subject.
///
/// Replaced wholesale on every save; there is no field-level merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorrectionSet {
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn same_page(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

impl CorrectionSet {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step whose page is `url`, ignoring a trailing slash.
    pub fn step_for_url(&self, url: &str) -> Option<&Step> {
        self.steps.iter().find(|s| same_page(&s.page_url, url))
    }

    /// The login step with the lowest `step_order`, if any.
    pub fn login_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .filter(|s| s.is_login())
            .min_by_key(|s| s.step_order)
    }

    /// First `step_order` not used by any existing step (0 for an empty set).
    pub fn next_step_order(&self) -> u32 {
        self.steps
            .iter()
            .map(|s| s.step_order)
            .max()
            .map_or(0, |max| max + 1)
    }

    /// `(step_order, depends_on_step_order)` pairs in document order.
    pub fn dependency_edges(&self) -> Vec<(u32, Option<u32>)> {
        self.steps
            .iter()
            .map(|s| (s.step_order, s.depends_on_step_order))
            .collect()
    }

    /// Copy with every sensitive `preset_value` nulled.
    pub fn redacted(&self) -> Self {
        let mut set = self.clone();
        for field in set.steps.iter_mut().flat_map(|s| s.fields.iter_mut()) {
            if field.is_sensitive {
                field.preset_value = None;
            }
        }
        set
    }

    /// Append steps discovered after a login, renumbering them from the next
    /// available order. Steps without a declared dependency are made to
    /// depend on `parent`. Returns the orders that were assigned.
    pub fn append_discovered(&mut self, discovered: Vec<Step>, parent: Option<u32>) -> Vec<u32> {
        let mut next = self.next_step_order();
        let mut assigned = Vec::with_capacity(discovered.len());
        for mut step in discovered {
            step.step_order = next;
            if step.depends_on_step_order.is_none() {
                step.depends_on_step_order = parent;
            }
            assigned.push(next);
            self.steps.push(step);
            next += 1;
        }
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(order: u32, url: &str, form_type: FormType) -> Step {
        Step {
            step_order: order,
            page_url: url.to_string(),
            form_type,
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_document_deserializes_with_defaults() {
        let json = r#"{"steps":[{"page_url":"https://x.test/form","fields":[{"field_name":"email"}]}]}"#;
        let set: CorrectionSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.steps.len(), 1);
        let s = &set.steps[0];
        assert_eq!(s.step_order, 0);
        assert_eq!(s.form_type, FormType::Target);
        assert!(s.depends_on_step_order.is_none());
        assert_eq!(s.fields[0].field_type, "text");
        assert!(!s.fields[0].is_sensitive);
    }

    #[test]
    fn test_empty_object_is_empty_set() {
        let set: CorrectionSet = serde_json::from_str("{}").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.next_step_order(), 0);
    }

    #[test]
    fn test_form_type_round_trips_snake_case() {
        assert_eq!(serde_json::to_string(&FormType::Intermediate).unwrap(), "\"intermediate\"");
        assert_eq!("login".parse::<FormType>().unwrap(), FormType::Login);
        assert!("checkout".parse::<FormType>().is_err());
    }

    #[test]
    fn test_step_for_url_ignores_trailing_slash() {
        let set = CorrectionSet::new(vec![
            step(0, "https://x.test/login/", FormType::Login),
            step(1, "https://x.test/apply", FormType::Target),
        ]);
        assert_eq!(set.step_for_url("https://x.test/login").unwrap().step_order, 0);
        assert_eq!(set.step_for_url("https://x.test/apply/").unwrap().step_order, 1);
        assert!(set.step_for_url("https://x.test/other").is_none());
    }

    #[test]
    fn test_login_step_picks_lowest_order() {
        let set = CorrectionSet::new(vec![
            step(4, "https://x.test/sso", FormType::Login),
            step(2, "https://x.test/login", FormType::Login),
            step(7, "https://x.test/apply", FormType::Target),
        ]);
        assert_eq!(set.login_step().unwrap().page_url, "https://x.test/login");
    }

    #[test]
    fn test_next_step_order_uses_max_not_len() {
        let set = CorrectionSet::new(vec![
            step(0, "a", FormType::Login),
            step(5, "b", FormType::Target),
        ]);
        assert_eq!(set.next_step_order(), 6);
    }

    #[test]
    fn test_append_discovered_renumbers_and_links_parent() {
        let mut set = CorrectionSet::new(vec![step(3, "https://x.test/login", FormType::Login)]);
        let mut explicit = step(0, "https://x.test/b", FormType::Target);
        explicit.depends_on_step_order = Some(3);
        let assigned = set.append_discovered(
            vec![step(0, "https://x.test/a", FormType::Intermediate), explicit],
            Some(3),
        );
        assert_eq!(assigned, vec![4, 5]);
        assert_eq!(set.steps[1].step_order, 4);
        assert_eq!(set.steps[1].depends_on_step_order, Some(3));
        assert_eq!(set.steps[2].step_order, 5);
        assert_eq!(set.steps[2].depends_on_step_order, Some(3));
    }

    #[test]
    fn test_redacted_nulls_only_sensitive_values() {
        let mut s = step(0, "https://x.test/login", FormType::Login);
        s.fields = vec![
            Field {
                field_name: "user".into(),
                preset_value: Some("alice".into()),
                ..Default::default()
            },
            Field {
                field_name: "password".into(),
                is_sensitive: true,
                preset_value: Some("hunter2".into()),
                ..Default::default()
            },
        ];
        let set = CorrectionSet::new(vec![s]);
        let clean = set.redacted();
        assert_eq!(clean.steps[0].fields[0].preset_value.as_deref(), Some("alice"));
        assert_eq!(clean.steps[0].fields[1].preset_value, None);
        assert_eq!(set.steps[0].fields[1].preset_value.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_needs_sealing_only_for_nonempty_sensitive_values() {
        let mut field = Field {
            is_sensitive: true,
            preset_value: Some(String::new()),
            ..Default::default()
        };
        assert!(!field.needs_sealing());
        field.preset_value = Some("hunter2".into());
        assert!(field.needs_sealing());
        field.is_sensitive = false;
        assert!(!field.needs_sealing());
    }
}
