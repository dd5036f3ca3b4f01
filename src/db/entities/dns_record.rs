use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i32,
    pub host: String,
    pub domain: String,
    pub record_type: String,
    pub answer: Option<String>, // comma separated
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn fqdn(&self) -> String {
        if self.host.is_empty() {
            self.domain.clone()
        } else {
            format!("{}.{}", self.host, self.domain)
        }
    }

    /// The stored answer as a lowercase set.
    pub fn answers(&self) -> BTreeSet<String> {
        self.answer
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect()
    }

    pub fn set_answers(&mut self, answers: &BTreeSet<String>) {
        self.answer = if answers.is_empty() {
            None
        } else {
            Some(answers.iter().cloned().collect::<Vec<_>>().join(","))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(answer: Option<&str>) -> Model {
        Model {
            id: 1,
            host: "vpn".to_string(),
            domain: "example.com".to_string(),
            record_type: "A".to_string(),
            answer: answer.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_answers_are_trimmed_lowercase_set() {
        let r = record(Some("1.2.3.4, 2001:DB8::1,,1.2.3.4"));
        let answers: Vec<_> = r.answers().into_iter().collect();
        assert_eq!(answers, vec!["1.2.3.4", "2001:db8::1"]);
        assert!(record(None).answers().is_empty());
    }

    #[test]
    fn test_set_answers_clears_empty_set() {
        let mut r = record(Some("1.2.3.4"));
        r.set_answers(&BTreeSet::new());
        assert_eq!(r.answer, None);
        assert_eq!(r.fqdn(), "vpn.example.com");
    }
}
