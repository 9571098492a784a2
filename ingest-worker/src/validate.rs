use tracing::debug;

use crate::parser::ParsedPosting;

/// Decides whether a parsed posting is worth persisting. Must not perform any I/O.
pub trait Validator: Send + Sync {
    fn is_acceptable(&self, posting: &ParsedPosting) -> bool;
}

/// Accepts job postings that name a title, a company and a job description.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecruitInfoValidator;

impl Validator for RecruitInfoValidator {
    fn is_acceptable(&self, posting: &ParsedPosting) -> bool {
        let rejection = if !posting.is_recruit_info {
            Some("not a job posting")
        } else if posting.title.trim().is_empty() {
            Some("missing title")
        } else if is_blank(&posting.company_name) {
            Some("missing company name")
        } else if is_blank(&posting.job_description) {
            Some("missing job description")
        } else {
            None
        };

        match rejection {
            Some(reason) => {
                debug!(title = %posting.title, reason, "posting rejected");
                false
            }
            None => true,
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |value| value.trim().is_empty())
}
