use std::collections::HashMap;
use strum_macros::{AsRefStr, Display, EnumString};

/// The various volume and publish context parameters understood by the node plugin.
#[derive(AsRefStr, EnumString, Display, Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parameters {
    /// Partition of the attached disk which holds the volume (volume context).
    #[strum(serialize = "partition")]
    Partition,
    /// The data cache mode, writeback or writethrough (publish context).
    #[strum(serialize = "data-cache-mode")]
    DataCacheMode,
    /// The data cache size (publish context).
    #[strum(serialize = "data-cache-size")]
    DataCacheSize,
}

impl Parameters {
    /// Lookup this parameter in the given context, treating an absent key as empty.
    pub fn value<'a>(&self, context: &'a HashMap<String, String>) -> &'a str {
        context.get(self.as_ref()).map(String::as_str).unwrap_or_default()
    }
    /// The partition to use, if any.
    pub fn partition(context: &HashMap<String, String>) -> &str {
        Self::Partition.value(context)
    }
    /// Whether the context carries any data cache parameters.
    pub fn has_data_cache(context: &HashMap<String, String>) -> bool {
        !Self::DataCacheMode.value(context).is_empty()
            || !Self::DataCacheSize.value(context).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_lookup() {
        let context = HashMap::from([
            ("partition".to_string(), "1".to_string()),
            ("data-cache-size".to_string(), "".to_string()),
        ]);
        assert_eq!(Parameters::partition(&context), "1");
        assert_eq!(Parameters::DataCacheMode.value(&context), "");
        assert!(!Parameters::has_data_cache(&context));

        let context = HashMap::from([("data-cache-mode".to_string(), "writeback".to_string())]);
        assert!(Parameters::has_data_cache(&context));
    }
}
