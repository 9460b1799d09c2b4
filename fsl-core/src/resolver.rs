//! Resource table resolution: index assignment, placement rules, per-target ceilings
//! and the cross-reference table the host links against.

use crate::ast::*;
use crate::{bail_semantic, err_semantic};
use crate::error::{CompilerError, Result};
use crate::target::Target;
use log::{debug, trace};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedResource {
    pub name: String,
    pub kind: ResourceKind,
    pub index: u32,
    pub array_len: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSet {
    pub frequency: Frequency,
    /// Shared fragment this set came from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    pub resources: Vec<ResolvedResource>,
    /// Number of descriptors (array elements counted individually).
    pub descriptor_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTable {
    pub name: String,
    pub sets: Vec<ResolvedSet>,
}

impl ResolvedTable {
    pub fn set(&self, frequency: Frequency) -> Option<&ResolvedSet> {
        self.sets.iter().find(|s| s.frequency == frequency)
    }

    /// Finds a resource by name, with the frequency of the set that holds it.
    pub fn resource(&self, name: &str) -> Option<(Frequency, &ResolvedResource)> {
        self.sets
            .iter()
            .find_map(|set| set.resources.iter().find(|r| r.name == name).map(|r| (set.frequency, r)))
    }

    pub fn index_of(&self, frequency: Frequency, name: &str) -> Option<u32> {
        self.set(frequency)?.resources.iter().find(|r| r.name == name).map(|r| r.index)
    }

    pub fn resources(&self) -> impl Iterator<Item = (Frequency, &ResolvedResource)> {
        self.sets.iter().flat_map(|set| set.resources.iter().map(move |r| (set.frequency, r)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// C header with one index constant per declaration and one count per set.
    pub fn c_header(&self) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "// Resource indices for table '{}'. Generated file, do not edit.", self.name)?;
        writeln!(out, "#pragma once")?;
        writeln!(out)?;
        writeln!(out, "#ifndef SRT_RES_IDX")?;
        writeln!(out, "#define SRT_RES_IDX(table, set, name) SRT_RES_IDX_##table##_##set##_##name")?;
        writeln!(out, "#define SRT_SET_COUNT(table, set) SRT_SET_COUNT_##table##_##set")?;
        writeln!(out, "#endif")?;
        for set in &self.sets {
            writeln!(out)?;
            writeln!(
                out,
                "#define SRT_SET_COUNT_{}_{} {}",
                self.name, set.frequency, set.descriptor_count
            )?;
            for res in &set.resources {
                writeln!(
                    out,
                    "#define SRT_RES_IDX_{}_{}_{} {}",
                    self.name, set.frequency, res.name, res.index
                )?;
            }
        }
        Ok(out)
    }
}

/// All tables of a program. Tables that failed to resolve are listed in `failed`
/// so entry points using other tables can still be generated.
#[derive(Debug, Default)]
pub struct ResolvedProgram {
    pub tables: BTreeMap<String, ResolvedTable>,
    pub errors: Vec<CompilerError>,
    pub failed: BTreeSet<String>,
}

impl ResolvedProgram {
    /// Looks up a table, turning an earlier resolution failure into an error.
    pub fn table(&self, name: &str) -> Result<&ResolvedTable> {
        if let Some(table) = self.tables.get(name) {
            return Ok(table);
        }
        if self.failed.contains(name) {
            bail_semantic!(name, "resource table failed to resolve");
        }
        bail_semantic!(name, "unknown resource table")
    }
}

/// Resolves every table and shared fragment declared anywhere in the program.
/// Identical re-declarations (the same header included by several blocks) collapse.
pub fn resolve_program(program: &Program) -> Result<ResolvedProgram> {
    let mut fragments: HashMap<&str, &SharedSet> = HashMap::new();
    let mut tables: Vec<&SrtDecl> = Vec::new();
    let mut duplicate_error = None;

    program.walk_items(&mut |item| match item {
        Item::SharedSet(shared) => match fragments.get(shared.name.as_str()) {
            Some(existing) if set_signature(&existing.set) != set_signature(&shared.set) => {
                duplicate_error.get_or_insert_with(|| {
                    CompilerError::semantic(&shared.name, "shared set declared twice with different contents")
                });
            }
            Some(_) => {}
            None => {
                fragments.insert(&shared.name, shared);
            }
        },
        Item::Srt(srt) => match tables.iter().find(|t| t.name == srt.name) {
            Some(existing) if table_signature(existing) != table_signature(srt) => {
                duplicate_error.get_or_insert_with(|| {
                    CompilerError::semantic(&srt.name, "resource table declared twice with different contents")
                });
            }
            Some(_) => {}
            None => tables.push(srt),
        },
        _ => {}
    });
    if let Some(err) = duplicate_error {
        return Err(err);
    }

    let mut resolved_fragments: HashMap<&str, ResolvedSet> = HashMap::new();
    let mut result = ResolvedProgram::default();
    for srt in tables {
        match resolve_table(srt, &fragments, &mut resolved_fragments) {
            Ok(table) => {
                debug!("resolved table '{}' ({} sets)", table.name, table.sets.len());
                result.tables.insert(table.name.clone(), table);
            }
            Err(err) => {
                result.failed.insert(srt.name.clone());
                result.errors.push(err);
            }
        }
    }
    Ok(result)
}

fn resolve_table<'a>(
    srt: &'a SrtDecl,
    fragments: &HashMap<&'a str, &'a SharedSet>,
    resolved_fragments: &mut HashMap<&'a str, ResolvedSet>,
) -> Result<ResolvedTable> {
    let mut sets = Vec::new();
    for source in &srt.sets {
        let set = match source {
            SetSource::Local(block) => resolve_set(&srt.name, block, None)?,
            SetSource::Shared { fragment, loc } => {
                let Some(&shared) = fragments.get(fragment.as_str()) else {
                    bail_semantic!(&srt.name, "unknown shared set '{}' included at {}", fragment, loc);
                };
                // A fragment is resolved once; every table reuses its indices verbatim.
                if !resolved_fragments.contains_key(shared.name.as_str()) {
                    let set = resolve_set(&shared.name, &shared.set, Some(&shared.name))?;
                    resolved_fragments.insert(shared.name.as_str(), set);
                }
                resolved_fragments[shared.name.as_str()].clone()
            }
        };
        sets.push(set);
    }

    let mut previous: Option<Frequency> = None;
    for set in &sets {
        if let Some(prev) = previous {
            if set.frequency <= prev {
                bail_semantic!(
                    &srt.name,
                    "set {} follows set {}; sets must appear once each in frequency order",
                    set.frequency,
                    prev
                );
            }
        }
        previous = Some(set.frequency);
    }

    // Samplers may only live in the first set of the table.
    for set in sets.iter().skip(1) {
        if let Some(sampler) = set.resources.iter().find(|r| r.kind.is_sampler()) {
            bail_semantic!(
                &srt.name,
                "sampler '{}' is declared in set {}; samplers are only allowed in the first set ({})",
                sampler.name,
                set.frequency,
                sets[0].frequency
            );
        }
    }

    let mut names = BTreeSet::new();
    for res in sets.iter().flat_map(|s| &s.resources) {
        if !names.insert(res.name.as_str()) {
            bail_semantic!(&srt.name, "resource '{}' is declared more than once", res.name);
        }
    }

    Ok(ResolvedTable {
        name: srt.name.clone(),
        sets,
    })
}

/// Single pass with a running counter that starts at zero for every set.
fn resolve_set(scope: &str, block: &SetBlock, fragment: Option<&str>) -> Result<ResolvedSet> {
    let mut next = 0u32;
    let mut resources = Vec::with_capacity(block.decls.len());
    for decl in &block.decls {
        if decl.frequency != block.frequency {
            bail_semantic!(
                scope,
                "'{}' at {} is marked {} inside a {} set",
                decl.name,
                decl.loc,
                decl.frequency,
                block.frequency
            );
        }
        trace!("{}: {} -> {}[{}]", scope, decl.name, block.frequency, next);
        resources.push(ResolvedResource {
            name: decl.name.clone(),
            kind: decl.kind.clone(),
            index: next,
            array_len: decl.array_len,
        });
        next = next.checked_add(decl.array_len).ok_or_else(|| {
            err_semantic!(
                scope,
                "'{}' at {} overflows the index range of the {} set",
                decl.name,
                decl.loc,
                block.frequency
            )
        })?;
    }
    Ok(ResolvedSet {
        frequency: block.frequency,
        fragment: fragment.map(str::to_string),
        resources,
        descriptor_count: next,
    })
}

fn set_signature(set: &SetBlock) -> String {
    let mut sig = format!("{}:", set.frequency);
    for decl in &set.decls {
        let _ = write!(sig, "{}/{:?}/{}/{};", decl.name, decl.kind, decl.array_len, decl.frequency);
    }
    sig
}

fn table_signature(srt: &SrtDecl) -> String {
    srt.sets
        .iter()
        .map(|source| match source {
            SetSource::Local(set) => set_signature(set),
            SetSource::Shared { fragment, .. } => format!("@{}", fragment),
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Descriptor counts by the categories the binding limits are expressed in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DescriptorCounts {
    samplers: u32,
    textures: u32,
    rw_textures: u32,
    buffers: u32,
    rw_buffers: u32,
    constant_buffers: u32,
}

impl DescriptorCounts {
    fn of(table: &ResolvedTable) -> Self {
        let mut counts = DescriptorCounts::default();
        for (_, res) in table.resources() {
            let slot = match res.kind {
                ResourceKind::Sampler { .. } => &mut counts.samplers,
                ResourceKind::Texture { .. } => &mut counts.textures,
                ResourceKind::RwTexture { .. } => &mut counts.rw_textures,
                ResourceKind::Buffer { .. } => &mut counts.buffers,
                ResourceKind::RwBuffer { .. } => &mut counts.rw_buffers,
                ResourceKind::ConstantBuffer { .. } => &mut counts.constant_buffers,
            };
            *slot = slot.saturating_add(res.array_len);
        }
        counts
    }
}

/// Checks a table against the target's fixed binding ceilings. `extended` is true when a
/// higher-capacity strategy (descriptor indexing, argument buffers) lifts them.
pub fn check_limits(table: &ResolvedTable, target: Target, extended: bool) -> Result<()> {
    if extended {
        return Ok(());
    }
    let c = DescriptorCounts::of(table);
    let checks: Vec<(&str, u32, u32)> = match target {
        Target::Direct3D12 => vec![
            ("samplers", c.samplers, 16),
            ("shader resource views", c.textures.saturating_add(c.buffers), 128),
            ("unordered access views", c.rw_textures.saturating_add(c.rw_buffers), 64),
            ("constant buffer views", c.constant_buffers, 14),
        ],
        Target::Vulkan => vec![
            ("samplers", c.samplers, 64),
            ("uniform buffers", c.constant_buffers, 15),
            ("storage buffers", c.buffers.saturating_add(c.rw_buffers), 30),
            ("sampled images", c.textures, 200),
            ("storage images", c.rw_textures, 16),
        ],
        Target::Metal => vec![
            ("textures", c.textures.saturating_add(c.rw_textures), 128),
            ("buffers", c.buffers.saturating_add(c.rw_buffers).saturating_add(c.constant_buffers), 31),
            ("samplers", c.samplers, 16),
        ],
    };
    for (what, count, limit) in checks {
        if count > limit {
            bail_semantic!(
                &table.name,
                "{} {} exceed the {} limit of {} without extended binding",
                count,
                what,
                target,
                limit
            );
        }
    }
    Ok(())
}
