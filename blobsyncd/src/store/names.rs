use super::StoreError;

const DEFAULT_CACHE: &str = "content_cache";
const DEFAULT_RESOLVED: &str = "resolved_objects";
const DEFAULT_QUEUE: &str = "pending_operations";
const DEFAULT_FAILED: &str = "failed_operations";

/// Table names for the store's collections.
///
/// Names end up inside SQL text, so only plain identifiers are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub cache: String,
    pub resolved: String,
    pub queue: String,
    pub failed: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            cache: DEFAULT_CACHE.to_string(),
            resolved: DEFAULT_RESOLVED.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            failed: DEFAULT_FAILED.to_string(),
        }
    }
}

impl CollectionNames {
    pub fn validate(&self) -> Result<(), StoreError> {
        let all = [&self.cache, &self.resolved, &self.queue, &self.failed];
        for name in all {
            if !is_identifier(name) {
                return Err(StoreError::InvalidCollectionName(name.clone()));
            }
        }
        for (i, name) in all.iter().enumerate() {
            if all[i + 1..]
                .iter()
                .any(|other| other.eq_ignore_ascii_case(name))
            {
                return Err(StoreError::InvalidCollectionName(name.to_string()));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CollectionNames::default().validate().unwrap();
    }

    #[test]
    fn rejects_sql_in_names() {
        let names = CollectionNames {
            queue: "ops; DROP TABLE x".into(),
            ..CollectionNames::default()
        };
        assert!(matches!(
            names.validate(),
            Err(StoreError::InvalidCollectionName(name)) if name.starts_with("ops;")
        ));
    }

    #[test]
    fn rejects_leading_digit_and_empty() {
        assert!(!is_identifier("1cache"));
        assert!(!is_identifier(""));
        assert!(is_identifier("_cache_2"));
    }

    #[test]
    fn rejects_shared_names() {
        let names = CollectionNames {
            resolved: "Content_Cache".into(),
            ..CollectionNames::default()
        };
        assert!(names.validate().is_err());
    }
}
