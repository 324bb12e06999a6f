//! Address list helpers.

/// Splits a comma-separated list (`host1:port1,host2:port2`), trimming
/// whitespace and dropping empty entries.
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
