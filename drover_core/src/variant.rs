use crate::workspace::WorkspaceLayout;
use std::fmt;
use std::path::PathBuf;

/// Instrumentation flavor of the target binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Harden,
    Asan,
    Coverage,
}

impl Variant {
    /// Variants that have a fuzzing binary set and a debug binary set.
    pub const FUZZING: [Variant; 2] = [Variant::Harden, Variant::Asan];

    pub fn name(&self) -> &'static str {
        match self {
            Variant::Harden => "harden",
            Variant::Asan => "asan",
            Variant::Coverage => "coverage",
        }
    }

    /// Directory name under `exploitable/` holding this variant's verified crashes.
    pub fn triage_prefix(&self) -> &'static str {
        match self {
            Variant::Harden => "HARDEN",
            Variant::Asan => "ASAN",
            Variant::Coverage => "COVERAGE",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One installed set of binaries under `binaries/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySet {
    Fuzz(Variant),
    Debug(Variant),
}

impl BinarySet {
    pub fn dir_name(&self) -> String {
        match self {
            BinarySet::Fuzz(Variant::Coverage) | BinarySet::Debug(Variant::Coverage) => {
                "coverage".to_string()
            }
            BinarySet::Fuzz(v) => format!("afl-{}", v.name()),
            BinarySet::Debug(v) => format!("{}-dbg", v.name()),
        }
    }

    /// Binary sets installed when the operator asks for `variant`.
    pub fn for_variant(variant: Variant) -> Vec<BinarySet> {
        match variant {
            Variant::Coverage => vec![BinarySet::Fuzz(Variant::Coverage)],
            v => vec![BinarySet::Fuzz(v), BinarySet::Debug(v)],
        }
    }

    pub fn install_dir(&self, layout: &WorkspaceLayout) -> PathBuf {
        layout.binaries_dir().join(self.dir_name())
    }

    pub fn binary_path(&self, layout: &WorkspaceLayout, target: &str) -> PathBuf {
        self.install_dir(layout).join("bin").join(target)
    }

    pub fn is_installed(&self, layout: &WorkspaceLayout) -> bool {
        self.install_dir(layout).is_dir()
    }
}
