// Output Assertions
// Checks evaluated against the records a test-mode job wrote to a sink

use crate::descriptor::Record;

use std::fmt;
use std::sync::Arc;

type CheckFn = Arc<dyn Fn(&[Record]) -> Result<(), String> + Send + Sync>;

/// An evaluable assertion over collected output records
#[derive(Clone)]
pub enum OutputAssertion {
    /// Same records as expected, in any order (multiset equality)
    ContainsInAnyOrder(Vec<Record>),
    /// Same records as expected, in the same order
    ContainsInOrder(Vec<Record>),
    IsEmpty,
    HasLen(usize),
    /// Arbitrary check; the error string becomes the failure detail
    Satisfies { description: String, check: CheckFn },
}

/// Result of evaluating a single assertion
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionResult {
    /// The assertion that was evaluated
    pub assertion: String,
    /// Whether the assertion passed
    pub passed: bool,
    /// Details about the failure (if any)
    pub failure_detail: Option<String>,
}

impl AssertionResult {
    fn pass(assertion: &OutputAssertion) -> Self {
        Self {
            assertion: assertion.to_string(),
            passed: true,
            failure_detail: None,
        }
    }

    fn fail(assertion: &OutputAssertion, detail: impl Into<String>) -> Self {
        Self {
            assertion: assertion.to_string(),
            passed: false,
            failure_detail: Some(detail.into()),
        }
    }
}

impl OutputAssertion {
    pub fn contains_in_any_order(expected: impl IntoIterator<Item = Record>) -> Self {
        Self::ContainsInAnyOrder(expected.into_iter().collect())
    }

    pub fn contains_in_order(expected: impl IntoIterator<Item = Record>) -> Self {
        Self::ContainsInOrder(expected.into_iter().collect())
    }

    pub fn satisfies<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&[Record]) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::Satisfies {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    /// Evaluate the assertion against collected records
    pub fn evaluate(&self, actual: &[Record]) -> AssertionResult {
        match self {
            OutputAssertion::ContainsInAnyOrder(expected) => {
                match multiset_difference(expected, actual) {
                    (missing, unexpected) if missing.is_empty() && unexpected.is_empty() => {
                        AssertionResult::pass(self)
                    }
                    (missing, unexpected) => AssertionResult::fail(
                        self,
                        format!(
                            "missing {} record(s) {}, unexpected {} record(s) {}",
                            missing.len(),
                            render(&missing),
                            unexpected.len(),
                            render(&unexpected)
                        ),
                    ),
                }
            }
            OutputAssertion::ContainsInOrder(expected) => {
                if expected.as_slice() == actual {
                    AssertionResult::pass(self)
                } else {
                    let position = expected
                        .iter()
                        .zip(actual)
                        .position(|(e, a)| e != a)
                        .unwrap_or_else(|| expected.len().min(actual.len()));
                    AssertionResult::fail(
                        self,
                        format!(
                            "first difference at index {} (expected {} record(s), got {})",
                            position,
                            expected.len(),
                            actual.len()
                        ),
                    )
                }
            }
            OutputAssertion::IsEmpty => {
                if actual.is_empty() {
                    AssertionResult::pass(self)
                } else {
                    AssertionResult::fail(self, format!("got {} record(s)", actual.len()))
                }
            }
            OutputAssertion::HasLen(len) => {
                if actual.len() == *len {
                    AssertionResult::pass(self)
                } else {
                    AssertionResult::fail(self, format!("got {} record(s)", actual.len()))
                }
            }
            OutputAssertion::Satisfies { check, .. } => match check(actual) {
                Ok(()) => AssertionResult::pass(self),
                Err(detail) => AssertionResult::fail(self, detail),
            },
        }
    }
}

impl fmt::Display for OutputAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputAssertion::ContainsInAnyOrder(expected) => {
                write!(f, "contains_in_any_order({})", render(expected))
            }
            OutputAssertion::ContainsInOrder(expected) => {
                write!(f, "contains_in_order({})", render(expected))
            }
            OutputAssertion::IsEmpty => write!(f, "is_empty"),
            OutputAssertion::HasLen(len) => write!(f, "has_len({})", len),
            OutputAssertion::Satisfies { description, .. } => {
                write!(f, "satisfies({})", description)
            }
        }
    }
}

impl fmt::Debug for OutputAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputAssertion({})", self)
    }
}

/// Records missing from `actual`, and records in `actual` not expected
fn multiset_difference(expected: &[Record], actual: &[Record]) -> (Vec<Record>, Vec<Record>) {
    let mut unexpected: Vec<Record> = actual.to_vec();
    let mut missing = Vec::new();
    for record in expected {
        match unexpected.iter().position(|r| r == record) {
            Some(index) => {
                unexpected.swap_remove(index);
            }
            None => missing.push(record.clone()),
        }
    }
    (missing, unexpected)
}

fn render(records: &[Record]) -> String {
    const LIMIT: usize = 10;
    let mut shown: Vec<String> = records.iter().take(LIMIT).map(|r| r.to_string()).collect();
    if records.len() > LIMIT {
        shown.push(format!("... {} more", records.len() - LIMIT));
    }
    format!("[{}]", shown.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contains_in_any_order() {
        let assertion = OutputAssertion::contains_in_any_order([json!(2), json!(4), json!(6)]);
        assert!(assertion.evaluate(&[json!(6), json!(2), json!(4)]).passed);

        let result = assertion.evaluate(&[json!(2), json!(4), json!(4)]);
        assert!(!result.passed);
        assert_eq!(
            result.failure_detail.as_deref(),
            Some("missing 1 record(s) [6], unexpected 1 record(s) [4]")
        );
    }

    #[test]
    fn test_contains_in_any_order_counts_duplicates() {
        let assertion = OutputAssertion::contains_in_any_order([json!("a"), json!("a")]);
        assert!(!assertion.evaluate(&[json!("a")]).passed);
        assert!(assertion.evaluate(&[json!("a"), json!("a")]).passed);
    }

    #[test]
    fn test_contains_in_order() {
        let assertion = OutputAssertion::contains_in_order([json!(1), json!(2)]);
        assert!(assertion.evaluate(&[json!(1), json!(2)]).passed);

        let result = assertion.evaluate(&[json!(2), json!(1)]);
        assert!(!result.passed);
        assert!(result.failure_detail.unwrap().starts_with("first difference at index 0"));
    }

    #[test]
    fn test_size_assertions() {
        assert!(OutputAssertion::IsEmpty.evaluate(&[]).passed);
        assert!(!OutputAssertion::IsEmpty.evaluate(&[json!(null)]).passed);
        assert!(OutputAssertion::HasLen(2).evaluate(&[json!(1), json!(1)]).passed);
    }

    #[test]
    fn test_satisfies() {
        let assertion = OutputAssertion::satisfies("all positive", |records| {
            if records.iter().all(|r| r.as_i64().unwrap_or(0) > 0) {
                Ok(())
            } else {
                Err("found a non-positive record".to_string())
            }
        });
        assert!(assertion.evaluate(&[json!(1), json!(5)]).passed);

        let result = assertion.evaluate(&[json!(1), json!(-5)]);
        assert_eq!(result.assertion, "satisfies(all positive)");
        assert_eq!(result.failure_detail.as_deref(), Some("found a non-positive record"));
    }
}
