//! Command registry and version resolution
//!
//! The registry maps each command code to one or more layout variants, each
//! valid over a disjoint range of driver versions. It is assembled once by a
//! [`RegistryBuilder`], checked for consistency, and read-only afterwards, so
//! a single instance can be shared by every worker thread.

pub mod commands;

pub use commands::{find_command, lookup_command, Command, UVM_COMMANDS};

use crate::config::AbiConfig;
use crate::error::{AbiError, AbiResult};
use crate::layout::{Compat, LayoutBuilder, LayoutDescriptor};
use crate::version::{DriverVersion, VersionRange};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// One layout valid over a range of driver versions
#[derive(Debug, Clone)]
pub struct Variant {
    /// Driver versions this layout applies to
    pub range: VersionRange,
    /// The laid-out structure
    pub layout: Arc<LayoutDescriptor>,
}

#[derive(Debug, Clone)]
struct Entry {
    command: Command,
    variants: Vec<Variant>,
}

/// Immutable command code to layout mapping
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    config: AbiConfig,
    entries: BTreeMap<u32, Entry>,
}

impl CommandRegistry {
    /// Start assembling a registry
    pub fn builder(config: AbiConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    /// Registry holding every UVM command
    pub fn uvm(config: AbiConfig) -> AbiResult<Self> {
        config.validate()?;
        let mut builder = RegistryBuilder::new(config);
        crate::layout::uvm::register_uvm(&mut builder)?;
        builder.build()
    }

    /// Configuration the layouts were computed from
    pub fn config(&self) -> &AbiConfig {
        &self.config
    }

    /// Registered command for `code`
    pub fn command(&self, code: u32) -> Option<&Command> {
        self.entries.get(&code).map(|e| &e.command)
    }

    /// All registered commands, ordered by code
    pub fn commands(&self) -> impl Iterator<Item = &Command> + '_ {
        self.entries.values().map(|e| &e.command)
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no command is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every variant of `code`, ordered by first version
    pub fn variants(&self, code: u32) -> AbiResult<&[Variant]> {
        self.entries
            .get(&code)
            .map(|e| e.variants.as_slice())
            .ok_or(AbiError::UnknownCommand(code))
    }

    /// Select the layout of `code` that applies at `version`
    ///
    /// Fails closed: if more than one variant covers the version the call is
    /// rejected rather than guessing.
    pub fn resolve(&self, code: u32, version: DriverVersion) -> AbiResult<&LayoutDescriptor> {
        self.resolve_variant(code, version).map(|v| v.layout.as_ref())
    }

    /// Like [`resolve`](Self::resolve), returning the variant with its range
    pub fn resolve_variant(&self, code: u32, version: DriverVersion) -> AbiResult<&Variant> {
        let entry = self.entries.get(&code).ok_or(AbiError::UnknownCommand(code))?;
        let mut matching = entry.variants.iter().filter(|v| v.range.contains(version));

        let first = matching.next().ok_or(AbiError::UnsupportedVersion {
            command: entry.command.name,
            version,
        })?;
        let extra = matching.count();
        if extra > 0 {
            return Err(AbiError::AmbiguousLayout {
                command: entry.command.name,
                version,
                candidates: extra + 1,
            });
        }

        log::trace!("{} at {} resolved to {} {}", entry.command.name, version, first.layout.name(), first.range);
        Ok(first)
    }

    /// JSON description of every command and variant
    pub fn to_json(&self) -> serde_json::Value {
        let commands: Vec<serde_json::Value> = self
            .entries
            .values()
            .map(|e| {
                let variants: Vec<serde_json::Value> = e
                    .variants
                    .iter()
                    .map(|v| {
                        serde_json::json!({
                            "range": v.range.to_string(),
                            "min": v.range.min,
                            "max": v.range.max,
                            "layout": v.layout.to_json(),
                        })
                    })
                    .collect();
                serde_json::json!({
                    "code": e.command.code,
                    "name": e.command.name,
                    "variants": variants,
                })
            })
            .collect();

        serde_json::json!({
            "config": self.config,
            "commands": commands,
        })
    }

    /// Write the registry as pretty-printed JSON, stamped with the export time
    pub fn export_json(&self, path: impl AsRef<Path>) -> AbiResult<()> {
        let path = path.as_ref();
        let mut doc = self.to_json();
        doc["generated_at"] = serde_json::Value::String(chrono::Utc::now().to_rfc3339());
        doc["crate_version"] = serde_json::Value::String(crate::VERSION.to_string());

        let text = serde_json::to_string_pretty(&doc)?;
        fs::write(path, text).map_err(|err| AbiError::Io {
            path: path.display().to_string(),
            err,
        })?;

        log::info!("exported {} commands to {}", self.len(), path.display());
        Ok(())
    }
}

/// Collects command variants and checks them into a [`CommandRegistry`]
#[derive(Debug)]
pub struct RegistryBuilder {
    config: AbiConfig,
    entries: BTreeMap<u32, Entry>,
}

impl RegistryBuilder {
    /// Empty builder laying out structures against `config`
    pub fn new(config: AbiConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
        }
    }

    /// Configuration used for layout
    pub fn config(&self) -> &AbiConfig {
        &self.config
    }

    /// Lay out `layout` and register it for `command` over `range`
    pub fn register(&mut self, command: Command, range: VersionRange, layout: LayoutBuilder) -> AbiResult<()> {
        let layout = layout.build(&self.config)?;
        self.register_layout(command, range, Arc::new(layout))
    }

    /// Register an already laid-out structure
    pub fn register_layout(
        &mut self,
        command: Command,
        range: VersionRange,
        layout: Arc<LayoutDescriptor>,
    ) -> AbiResult<()> {
        if range.is_empty() {
            return Err(AbiError::Registry(format!("{}: empty version range {}", command.name, range)));
        }

        let entry = self.entries.entry(command.code).or_insert_with(|| Entry {
            command,
            variants: Vec::new(),
        });
        if entry.command != command {
            return Err(AbiError::Registry(format!(
                "code {:#x} registered as both {} and {}",
                command.code, entry.command.name, command.name
            )));
        }

        entry.variants.push(Variant { range, layout });
        Ok(())
    }

    /// Check every command and freeze the registry
    ///
    /// Variants of one command must not overlap, must share a lineage, and
    /// every `Identical` field must sit at the same offset with the same
    /// width as in the earliest variant.
    pub fn build(self) -> AbiResult<CommandRegistry> {
        let registry = self.freeze();
        let mut variant_count = 0;

        for entry in registry.entries.values() {
            check_entry(entry)?;
            variant_count += entry.variants.len();
        }

        log::debug!(
            "command registry ready: {} commands, {} layout variants",
            registry.len(),
            variant_count
        );
        Ok(registry)
    }

    /// Freeze without consistency checks
    #[cfg(test)]
    pub(crate) fn build_unchecked(self) -> CommandRegistry {
        self.freeze()
    }

    fn freeze(self) -> CommandRegistry {
        let mut entries = self.entries;
        for entry in entries.values_mut() {
            entry.variants.sort_by_key(|v| v.range.min);
        }
        CommandRegistry {
            config: self.config,
            entries,
        }
    }
}

fn check_entry(entry: &Entry) -> AbiResult<()> {
    let name = entry.command.name;
    let variants = &entry.variants;

    for (i, a) in variants.iter().enumerate() {
        for b in &variants[i + 1..] {
            if a.range.overlaps(&b.range) {
                return Err(AbiError::Registry(format!(
                    "{}: {} {} overlaps {} {}",
                    name,
                    a.layout.name(),
                    a.range,
                    b.layout.name(),
                    b.range
                )));
            }
        }
    }

    let Some(baseline) = variants.first() else {
        return Ok(());
    };
    let baseline = &baseline.layout;

    for later in &variants[1..] {
        let layout = &later.layout;
        if layout.lineage() != baseline.lineage() {
            return Err(AbiError::Registry(format!(
                "{}: {} does not descend from {}",
                name,
                layout.name(),
                baseline.name()
            )));
        }
    }

    // an identical field sits at the same place in every variant
    for a in variants {
        for b in variants.iter().filter(|b| !Arc::ptr_eq(&a.layout, &b.layout)) {
            for field in a.layout.data_fields().filter(|f| f.compat == Compat::Identical) {
                let same = b.layout.field(field.name).is_some_and(|other| {
                    other.offset == field.offset && other.width() == field.width() && other.ty.same_kind(&field.ty)
                });
                if !same {
                    return Err(AbiError::Registry(format!(
                        "{}: identical field {}.{} at offset {} does not match {}",
                        name,
                        a.layout.name(),
                        field.name,
                        field.offset,
                        b.layout.name()
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::layout::uvm::{BASELINE, V550};
    use super::commands::{UVM_FREE, UVM_MAP_EXTERNAL_ALLOCATION, UVM_REGISTER_GPU};
    use pretty_assertions::assert_eq;

    const CMD: Command = Command::new(0x99, "TEST_CMD");

    fn v(major: u32, minor: u32, patch: u32) -> DriverVersion {
        DriverVersion::new(major, minor, patch)
    }

    fn params(name: &'static str) -> LayoutBuilder {
        LayoutBuilder::new(name).u64("Base").u64("Length").status("RMStatus").pad(4)
    }

    #[test]
    fn test_uvm_registry_is_complete() {
        let registry = CommandRegistry::uvm(AbiConfig::default()).unwrap();
        assert_eq!(registry.len(), UVM_COMMANDS.len());
        let codes: Vec<u32> = registry.commands().map(|c| c.code).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        assert_eq!(codes, sorted);
        assert_eq!(registry.variants(UVM_MAP_EXTERNAL_ALLOCATION).unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let registry = CommandRegistry::uvm(AbiConfig::default()).unwrap();
        let a = registry.resolve(UVM_REGISTER_GPU, v(535, 104, 5)).unwrap();
        let b = registry.resolve(UVM_REGISTER_GPU, v(535, 104, 5)).unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_range_boundaries() {
        let registry = CommandRegistry::uvm(AbiConfig::default()).unwrap();
        let before = registry.resolve(UVM_MAP_EXTERNAL_ALLOCATION, v(550, 40, 6)).unwrap();
        let at = registry.resolve(UVM_MAP_EXTERNAL_ALLOCATION, V550).unwrap();
        assert_eq!(before.name(), "UVM_MAP_EXTERNAL_ALLOCATION_PARAMS");
        assert_eq!(at.name(), "UVM_MAP_EXTERNAL_ALLOCATION_PARAMS_V550");
        assert!(registry.resolve(UVM_FREE, BASELINE).is_ok());
    }

    #[test]
    fn test_unknown_command() {
        let registry = CommandRegistry::uvm(AbiConfig::default()).unwrap();
        let err = registry.resolve(0x1234, v(535, 0, 0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert!(registry.variants(0x1234).is_err());
    }

    #[test]
    fn test_gap_is_unsupported() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        builder.register(CMD, VersionRange::new(v(1, 0, 0), v(2, 0, 0)), params("P")).unwrap();
        builder
            .register(CMD, VersionRange::since(v(3, 0, 0)), params("P_V3").renamed_from("P"))
            .unwrap();
        let registry = builder.build().unwrap();

        let err = registry.resolve(CMD.code, v(2, 5, 0)).unwrap_err();
        assert!(matches!(err, AbiError::UnsupportedVersion { command: "TEST_CMD", .. }));
        assert_eq!(registry.resolve(CMD.code, v(3, 1, 0)).unwrap().name(), "P_V3");
    }

    #[test]
    fn test_overlap_is_a_defect() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        builder.register(CMD, VersionRange::since(v(1, 0, 0)), params("P")).unwrap();
        builder
            .register(CMD, VersionRange::since(v(2, 0, 0)), params("P_V2").renamed_from("P"))
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_ambiguity_fails_closed() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        builder.register(CMD, VersionRange::since(v(1, 0, 0)), params("P")).unwrap();
        builder
            .register(CMD, VersionRange::since(v(2, 0, 0)), params("P_V2").renamed_from("P"))
            .unwrap();
        let registry = builder.build_unchecked();

        assert_eq!(registry.resolve(CMD.code, v(1, 5, 0)).unwrap().name(), "P");
        let err = registry.resolve(CMD.code, v(2, 5, 0)).unwrap_err();
        assert!(matches!(err, AbiError::AmbiguousLayout { candidates: 2, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_identical_field_must_keep_offset() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        let baseline = LayoutBuilder::new("P")
            .u64("Base")
            .version_specific()
            .u64("Length")
            .version_specific()
            .status("RMStatus")
            .version_specific()
            .pad(4);
        builder.register(CMD, VersionRange::new(v(1, 0, 0), v(2, 0, 0)), baseline).unwrap();
        let moved = LayoutBuilder::new("P_V2")
            .renamed_from("P")
            .u64("Extra")
            .version_specific()
            .u64("Base")
            .identical()
            .status("RMStatus")
            .pad(4);
        builder.register(CMD, VersionRange::since(v(2, 0, 0)), moved).unwrap();

        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("identical field P_V2.Base"));
    }

    #[test]
    fn test_baseline_identical_field_must_match_later_variant() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        builder.register(CMD, VersionRange::new(v(1, 0, 0), v(2, 0, 0)), params("P")).unwrap();
        let grown = LayoutBuilder::new("P_V2")
            .renamed_from("P")
            .u64("Base")
            .identical()
            .u64("Length")
            .identical()
            .u32("Extra")
            .version_specific()
            .status("RMStatus");
        builder.register(CMD, VersionRange::since(v(2, 0, 0)), grown).unwrap();

        let err = builder.build().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("identical field P.RMStatus at offset 16"));
    }

    #[test]
    fn test_uvm_identical_fields_agree_across_variants() {
        let registry = CommandRegistry::uvm(AbiConfig::default()).unwrap();
        for cmd in registry.commands() {
            let variants = registry.variants(cmd.code).unwrap();
            for a in variants {
                for b in variants {
                    for field in a.layout.data_fields().filter(|f| f.compat == Compat::Identical) {
                        let other = b.layout.field(field.name);
                        assert_eq!(
                            other.map(|o| (o.offset, o.width())),
                            Some((field.offset, field.width())),
                            "{}.{}",
                            a.layout.name(),
                            field.name
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_variants_must_share_lineage() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        builder.register(CMD, VersionRange::new(v(1, 0, 0), v(2, 0, 0)), params("P")).unwrap();
        builder.register(CMD, VersionRange::since(v(2, 0, 0)), params("Q")).unwrap();
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("does not descend from"));
    }

    #[test]
    fn test_registration_defects() {
        let mut builder = RegistryBuilder::new(AbiConfig::default());
        let empty = VersionRange::new(v(2, 0, 0), v(1, 0, 0));
        assert!(builder.register(CMD, empty, params("P")).is_err());

        builder.register(CMD, VersionRange::since(v(1, 0, 0)), params("P")).unwrap();
        let renamed = Command::new(CMD.code, "OTHER");
        let err = builder.register(renamed, VersionRange::since(v(5, 0, 0)), params("P")).unwrap_err();
        assert!(err.to_string().contains("registered as both"));
    }

    #[test]
    fn test_export_json() {
        let registry = CommandRegistry::uvm(AbiConfig::default()).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        registry.export_json(file.path()).unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(doc["generated_at"].is_string());
        assert_eq!(doc["commands"].as_array().unwrap().len(), UVM_COMMANDS.len());
        assert_eq!(doc["config"]["max_devices"], 32);

        let map_external = doc["commands"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["code"] == UVM_MAP_EXTERNAL_ALLOCATION)
            .unwrap();
        assert_eq!(map_external["variants"][1]["min"], "550.40.07");
        assert!(map_external["variants"][1]["max"].is_null());
    }
}
