//! This module contains the wrapper around the loaded intrinsics module:
//! the pre-authored IR file carrying the handler semantics and the helper
//! stubs the lifter clones.

use std::{collections::HashMap, fs, path::Path};

use crate::{
    error::lifting::{Error, Result},
    il::{FuncId, GlobalId, Module},
};

/// The loaded intrinsics module together with the resolved helpers.
///
/// The helper functions themselves are never mutated; the lifter works on
/// clones.
#[derive(Clone, Debug)]
pub struct Intrinsics {
    /// The module everything lives in. Lifted functions are added to it so
    /// they can call the semantics directly.
    pub module: Module,

    /// `VirtualFunction`: the final-function wrapper.
    pub virtual_function: FuncId,

    /// `VirtualStub`: the declaration the wrappers call; redirected to the
    /// assembled CFG stub on cloning.
    pub virtual_stub: FuncId,

    /// `VirtualStubEmpty`: the empty stub cloned into block functions and
    /// CFG stubs.
    pub virtual_stub_empty: FuncId,

    /// `KeepReturn`: the sentinel call located by name after optimization.
    pub keep_return: FuncId,

    /// `SlicePC`: the slice-function wrapper.
    pub slice_pc: FuncId,

    /// The `RAM` segment base.
    pub ram: GlobalId,

    /// The `__undef` sentinel.
    pub undef: GlobalId,
}

impl Intrinsics {
    /// Loads and resolves the intrinsics module at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::Read {
            path:    path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_text(&text)
    }

    /// Resolves an already-parsed textual intrinsics module.
    pub fn from_text(text: &str) -> Result<Self> {
        let module = crate::il::parser::parse_module(text)?;

        let function = |name: &str| {
            module.function_by_name(name).ok_or_else(|| Error::MissingIntrinsic {
                name: name.to_owned(),
            })
        };
        let global = |name: &str| {
            module.global_by_name(name).ok_or_else(|| Error::MissingIntrinsic {
                name: name.to_owned(),
            })
        };

        let virtual_function = function("VirtualFunction")?;
        let virtual_stub = function("VirtualStub")?;
        let virtual_stub_empty = function("VirtualStubEmpty")?;
        let keep_return = function("KeepReturn")?;
        let slice_pc = function("SlicePC")?;
        let ram = global("RAM")?;
        let undef = global("__undef")?;

        // Every SEM_ pointer must resolve to a defined function.
        let semantics: HashMap<String, FuncId> = module.semantic_table();
        for (_, g) in module.globals() {
            if let Some(name) = g.name.strip_prefix("SEM_") {
                if !semantics.contains_key(name) {
                    return Err(Error::UnresolvedSemantic {
                        name: g.name.clone(),
                    });
                }
            }
        }

        Ok(Self {
            module,
            virtual_function,
            virtual_stub,
            virtual_stub_empty,
            keep_return,
            slice_pc,
            ram,
            undef,
        })
    }
}
