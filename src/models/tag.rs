use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

/// Trim, drop empties and collapse case-insensitive duplicates, keeping the
/// first spelling seen.
pub fn normalize_tag_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter_map(|name| {
            let name = name.as_ref().trim();
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}
