// Tunables for a VM instance, loadable from a RON file.

use std::fs;

use serde::Deserialize;

use crate::error::{Error, Result};


#[derive(Deserialize, Debug, Copy, Clone, PartialEq)]
#[serde(default)]
pub struct VMParameters {
    // Byte size of each of the two heap regions at startup. The
    // collector grows them as needed, so small values just mean more
    // overflow allocations early on.
    pub initial_heap_size: usize,
    // How many collection requests are ignored before one is
    // honored; i32::MAX effectively disables the collector.
    pub functions_calls_per_gc_run: i32,
}


impl Default for VMParameters {
    fn default() -> VMParameters {
        VMParameters {
            initial_heap_size: 1024 * 1024,
            functions_calls_per_gc_run: 1024,
        }
    }
}


pub fn load(path: &str) -> Result<VMParameters> {
    let source = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
    from_str(&source)
}

pub fn from_str(source: &str) -> Result<VMParameters> {
    ron::de::from_str(source).map_err(|e| Error::Config(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let params = VMParameters::default();
        assert!(params.initial_heap_size > 0);
        assert!(params.functions_calls_per_gc_run > 0);
    }

    #[test]
    fn parses_ron() {
        let params = from_str(
            "(initial_heap_size: 4096, functions_calls_per_gc_run: 1)",
        )
        .unwrap();
        assert_eq!(params.initial_heap_size, 4096);
        assert_eq!(params.functions_calls_per_gc_run, 1);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let params = from_str("(functions_calls_per_gc_run: 7)").unwrap();
        assert_eq!(params.functions_calls_per_gc_run, 7);
        assert_eq!(
            params.initial_heap_size,
            VMParameters::default().initial_heap_size
        );
    }

    #[test]
    fn bad_input_is_a_config_error() {
        assert!(matches!(from_str("[1, 2"), Err(Error::Config(_))));
        assert!(matches!(load("/no/such/file.ron"), Err(Error::Config(_))));
    }
}
