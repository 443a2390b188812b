use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum ShaderLoadError {
    #[error("No shader directory containing {names:?} found under {searched:?}")]
    NotFound {
        names: Vec<String>,
        searched: Vec<PathBuf>,
    },

    #[error("Failed to read shader artifact {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a multiple of 4")]
    InvalidLength(usize),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// The base directories probed for a `shaders/` subdirectory, in priority
/// order: the running executable's directory, the conventional build output
/// location, then the working directory.
pub fn default_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::with_capacity(3);
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        roots.push(dir.to_path_buf());
    }
    roots.push(PathBuf::from("out/tri-app/debug"));
    roots.push(PathBuf::from("."));
    roots
}

/// Probe `roots` in order for a `shaders/` directory containing every file in
/// `names`. The first fully-populated directory wins; a directory with only
/// some of the files is skipped.
pub fn find_shader_dir(roots: &[PathBuf], names: &[&str]) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        let dir = root.join("shaders");
        names
            .iter()
            .all(|name| dir.join(name).is_file())
            .then_some(dir)
    })
}

/// The compiled SPIR-V for one vertex + fragment stage pair.
#[derive(Debug)]
pub struct ShaderSet {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
}

impl ShaderSet {
    /// Locate and read `vert_name` and `frag_name` from the first root whose
    /// `shaders/` directory holds both.
    pub fn load(
        roots: &[PathBuf],
        vert_name: &str,
        frag_name: &str,
    ) -> Result<Self, ShaderLoadError> {
        let dir = find_shader_dir(roots, &[vert_name, frag_name]).ok_or_else(|| {
            ShaderLoadError::NotFound {
                names: vec![vert_name.to_owned(), frag_name.to_owned()],
                searched: roots.to_vec(),
            }
        })?;

        tracing::debug!("Loading shaders from {}", dir.display());

        let read = |name: &str| -> Result<Vec<u8>, ShaderLoadError> {
            let path = dir.join(name);
            std::fs::read(&path).map_err(|source| ShaderLoadError::Io { path, source })
        };

        Ok(Self {
            vertex: read(vert_name)?,
            fragment: read(frag_name)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// `spirv_bytes` must have a length that is a multiple of 4. If the bytes
    /// are not already aligned to `u32`, they are copied internally.
    pub fn new(device: &Arc<Device>, spirv_bytes: &[u8]) -> Result<Self, CreateShaderModuleError> {
        if !spirv_bytes.len().is_multiple_of(4) {
            return Err(CreateShaderModuleError::InvalidLength(spirv_bytes.len()));
        }

        // Reinterpret bytes as u32 words. If the slice is already u32-aligned
        // we borrow it directly; otherwise we copy into a temporary Vec.
        //
        // SAFETY: u32 has no invalid bit patterns and we verified the length
        // is a multiple of 4, so the reinterpretation is sound. SPIR-V is
        // little-endian, so the copy path uses from_le_bytes; the borrow path
        // via align_to is only reached where native and SPIR-V order match.
        let (prefix, aligned_words, _suffix) = unsafe { spirv_bytes.align_to::<u32>() };
        let owned;
        let code: &[u32] = if prefix.is_empty() {
            aligned_words
        } else {
            owned = spirv_bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect::<Vec<u32>>();
            &owned
        };

        let create_info = vk::ShaderModuleCreateInfo::default().code(code);

        // SAFETY: create_info contains valid SPIR-V code words.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Read SPIR-V from `path` and create a module from it.
    pub fn from_file(
        device: &Arc<Device>,
        path: &Path,
    ) -> Result<Self, CreateShaderModuleFromFileError> {
        let bytes = std::fs::read(path).map_err(|source| CreateShaderModuleFromFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(device, &bytes).map_err(CreateShaderModuleFromFileError::Create)
    }

    /// Create an [`EntryPoint`] view into this module for the given entry
    /// point name and shader stage.
    ///
    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

#[derive(Debug, Error)]
pub enum CreateShaderModuleFromFileError {
    #[error("Failed to read shader file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Create(CreateShaderModuleError),
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. All pipeline objects derived
        // from this module must be destroyed before this ShaderModule.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A borrow-view pairing a [`ShaderModule`] with a specific entry point name
/// and pipeline stage.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    /// Build a `VkPipelineShaderStageCreateInfo` referencing this entry point.
    ///
    /// The returned struct borrows from `self`, so it must not outlive this
    /// `EntryPoint`.
    pub fn as_pipeline_stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERT: &str = "tri.vert.spv";
    const FRAG: &str = "tri.frag.spv";

    fn populate(root: &Path, names: &[&str]) {
        let dir = root.join("shaders");
        std::fs::create_dir_all(&dir).unwrap();
        for name in names {
            std::fs::write(dir.join(name), b"\x03\x02\x23\x07").unwrap();
        }
    }

    #[test]
    fn probing_skips_partially_populated_roots() {
        let partial = tempfile::tempdir().unwrap();
        let complete = tempfile::tempdir().unwrap();
        populate(partial.path(), &[VERT]);
        populate(complete.path(), &[VERT, FRAG]);

        let roots = [
            partial.path().to_path_buf(),
            complete.path().to_path_buf(),
        ];
        let found = find_shader_dir(&roots, &[VERT, FRAG]).unwrap();
        assert_eq!(found, complete.path().join("shaders"));
    }

    #[test]
    fn probing_takes_first_complete_root() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        populate(first.path(), &[VERT, FRAG]);
        populate(second.path(), &[VERT, FRAG]);

        let roots = [first.path().to_path_buf(), second.path().to_path_buf()];
        let found = find_shader_dir(&roots, &[VERT, FRAG]).unwrap();
        assert_eq!(found, first.path().join("shaders"));
    }

    #[test]
    fn probing_fails_when_nothing_matches() {
        let empty = tempfile::tempdir().unwrap();
        let roots = [empty.path().to_path_buf()];
        assert!(find_shader_dir(&roots, &[VERT, FRAG]).is_none());
    }

    #[test]
    fn load_reports_searched_roots_on_miss() {
        let empty = tempfile::tempdir().unwrap();
        let roots = [empty.path().to_path_buf()];

        let err = ShaderSet::load(&roots, VERT, FRAG).unwrap_err();
        match err {
            ShaderLoadError::NotFound { names, searched } => {
                assert_eq!(names, vec![VERT.to_owned(), FRAG.to_owned()]);
                assert_eq!(searched, roots);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn load_reads_both_artifacts() {
        let root = tempfile::tempdir().unwrap();
        populate(root.path(), &[VERT, FRAG]);

        let set = ShaderSet::load(&[root.path().to_path_buf()], VERT, FRAG).unwrap();
        assert_eq!(set.vertex, b"\x03\x02\x23\x07");
        assert_eq!(set.fragment, b"\x03\x02\x23\x07");
    }

    #[test]
    fn default_roots_end_with_working_directory() {
        let roots = default_search_roots();
        assert!(roots.len() >= 2);
        assert_eq!(roots.last().unwrap(), &PathBuf::from("."));
        assert!(roots.contains(&PathBuf::from("out/tri-app/debug")));
    }
}
