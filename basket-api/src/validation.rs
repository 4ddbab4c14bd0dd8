use basket_core::{ProductRecord, ValidationError};
use url::Url;

use crate::collaborators::{ValidationCollaborator, ValidationReport};

/// Structural checks applied to every scraped record.
///
/// - name is not blank
/// - url, when present, is an absolute http(s) URL
/// - price, when present, is not negative
/// - currency, when present, is three ASCII letters
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeValidator;

impl ShapeValidator {
    pub fn check(record: &ProductRecord) -> Result<(), ValidationError> {
        if record.name.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "name".to_string(),
            });
        }

        if !record.url.is_empty() {
            let parsed = Url::parse(&record.url).map_err(|e| ValidationError::InvalidValue {
                field: "url".to_string(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::InvalidValue {
                    field: "url".to_string(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        }

        if record.price.is_some_and(|p| p.is_sign_negative() && !p.is_zero()) {
            return Err(ValidationError::InvalidValue {
                field: "price".to_string(),
                reason: "negative".to_string(),
            });
        }

        if !record.currency.is_empty()
            && !(record.currency.len() == 3 && record.currency.chars().all(|c| c.is_ascii_alphabetic()))
        {
            return Err(ValidationError::InvalidValue {
                field: "currency".to_string(),
                reason: format!("'{}' is not a three-letter code", record.currency),
            });
        }

        Ok(())
    }
}

impl ValidationCollaborator for ShapeValidator {
    fn validate(&self, records: Vec<ProductRecord>) -> ValidationReport {
        let mut report = ValidationReport::default();
        for record in records {
            match Self::check(&record) {
                Ok(()) => report.valid.push(record),
                Err(e) => report.invalid.push((record, e)),
            }
        }
        report
    }
}
