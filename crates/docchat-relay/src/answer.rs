/// An answer split into its lead paragraph and trailing remarks.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FormattedAnswer {
    pub main: String,
    pub remarks: String,
}

impl FormattedAnswer {
    /// Renders the answer with an `Additional Context:` section when remarks
    /// are present.
    pub fn render(&self) -> String {
        if self.remarks.is_empty() {
            self.main.clone()
        } else {
            format!("{}\n\nAdditional Context:\n{}", self.main, self.remarks)
        }
    }
}

/// Splits a finished answer at its first blank line.
pub fn split_answer(answer: &str) -> FormattedAnswer {
    let trimmed = answer.trim();
    match trimmed.split_once("\n\n") {
        Some((main, rest)) => FormattedAnswer {
            main: main.trim().to_string(),
            remarks: rest.trim().to_string(),
        },
        None => FormattedAnswer {
            main: trimmed.to_string(),
            remarks: String::new(),
        },
    }
}
