//! Target platforms and their per-platform constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Direct3D12,
    Vulkan,
    Metal,
}

/// How a target groups resources into binding-model objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindingModel {
    DescriptorTables,
    DescriptorSets,
    ArgumentBuffers,
    DirectBinding,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::Direct3D12, Target::Vulkan, Target::Metal];

    pub fn name(self) -> &'static str {
        match self {
            Target::Direct3D12 => "direct3d12",
            Target::Vulkan => "vulkan",
            Target::Metal => "metal",
        }
    }

    /// Symbol visible to `#if` conditions while generating for this target.
    pub fn symbol(self) -> &'static str {
        match self {
            Target::Direct3D12 => "DIRECT3D12",
            Target::Vulkan => "VULKAN",
            Target::Metal => "METAL",
        }
    }

    /// Stable numeric code used in variant container directories.
    pub fn code(self) -> u32 {
        match self {
            Target::Direct3D12 => 1,
            Target::Vulkan => 2,
            Target::Metal => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Target> {
        Target::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn source_extension(self) -> &'static str {
        match self {
            Target::Direct3D12 => "hlsl",
            Target::Vulkan => "glsl",
            Target::Metal => "metal",
        }
    }

    pub fn binary_extension(self) -> &'static str {
        match self {
            Target::Direct3D12 => "dxil",
            Target::Vulkan => "spv",
            Target::Metal => "metallib",
        }
    }

    /// Parses a `--target` value; `all` expands to every target.
    pub fn parse_list(value: &str) -> Result<Vec<Target>, String> {
        if value.eq_ignore_ascii_case("all") {
            return Ok(Target::ALL.to_vec());
        }
        value.split(',').map(|part| part.trim().parse()).collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct3d12" | "d3d12" | "dx12" => Ok(Target::Direct3D12),
            "vulkan" | "vk" => Ok(Target::Vulkan),
            "metal" | "mtl" => Ok(Target::Metal),
            other => Err(format!("unknown target '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_list() {
        assert_eq!(Target::parse_list("all").unwrap(), Target::ALL.to_vec());
        assert_eq!(
            Target::parse_list("vulkan, d3d12").unwrap(),
            vec![Target::Vulkan, Target::Direct3D12]
        );
        assert!(Target::parse_list("opengl").is_err());
    }

    #[test]
    fn test_codes_round_trip() {
        for target in Target::ALL {
            assert_eq!(Target::from_code(target.code()), Some(target));
        }
        assert_eq!(Target::from_code(0), None);
    }
}
