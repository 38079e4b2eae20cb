#![forbid(unsafe_code)]

//! Reserved identifiers introduced by instrumentation.

pub const PREFIX: &str = "__SHADOWDP_";
pub const V_EPSILON: &str = "__SHADOWDP_v_epsilon";
pub const DIFFERING_INDEX: &str = "__SHADOWDP_index";

const ALIGNED_PREFIX: &str = "__SHADOWDP_ALIGNED_DISTANCE_";
const SHADOW_PREFIX: &str = "__SHADOWDP_SHADOW_DISTANCE_";

/// Which of the two tracked distances of a variable is meant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    Aligned,
    Shadow,
}

impl Version {
    pub const BOTH: [Version; 2] = [Version::Aligned, Version::Shadow];

    pub fn distance_var(self, var: &str) -> String {
        match self {
            Version::Aligned => format!("{ALIGNED_PREFIX}{var}"),
            Version::Shadow => format!("{SHADOW_PREFIX}{var}"),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Version::Aligned => "ALIGNED",
            Version::Shadow => "SHADOW",
        }
    }
}

/// `__SHADOWDP_SHADOW_DISTANCE_bq` -> `(Shadow, "bq")`.
pub fn parse_distance_var(name: &str) -> Option<(Version, &str)> {
    if let Some(var) = name.strip_prefix(ALIGNED_PREFIX) {
        return Some((Version::Aligned, var));
    }
    name.strip_prefix(SHADOW_PREFIX).map(|var| (Version::Shadow, var))
}

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(PREFIX)
}

/// Names that only appear in output this engine has already produced.
pub fn is_instrumentation_artifact(name: &str) -> bool {
    name.contains("_ALIGNED_DISTANCE") || name.contains("_SHADOW_DISTANCE") || name == DIFFERING_INDEX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_names_round_trip() {
        let name = Version::Shadow.distance_var("bq");
        assert_eq!(name, "__SHADOWDP_SHADOW_DISTANCE_bq");
        assert_eq!(parse_distance_var(&name), Some((Version::Shadow, "bq")));
        assert_eq!(parse_distance_var("bq"), None);
    }
}
