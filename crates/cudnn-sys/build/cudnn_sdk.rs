use std::env;
use std::error;
use std::fs;
use std::path;

/// A cuDNN installation found on the build host.
#[derive(Debug, Clone)]
pub struct CudnnSdk {
    include_dir: path::PathBuf,
    version: [u32; 3],
}

impl CudnnSdk {
    /// Locates the cuDNN headers and reads the library version from `cudnn_version.h`.
    ///
    /// `CUDNN_INCLUDE_DIR` is searched before the default locations.
    pub fn locate() -> Result<Self, Box<dyn error::Error>> {
        let include_dir = Self::find_include_dir()?;
        let header = fs::read_to_string(include_dir.join("cudnn_version.h"))?;
        let version = [
            Self::read_define(&header, "CUDNN_MAJOR")?,
            Self::read_define(&header, "CUDNN_MINOR")?,
            Self::read_define(&header, "CUDNN_PATCHLEVEL")?,
        ];
        Ok(Self {
            include_dir,
            version,
        })
    }

    pub fn include_dir(&self) -> &path::Path {
        &self.include_dir
    }

    /// The version as a single number, 8.9.7 being 80907.
    pub fn version(&self) -> u32 {
        let [major, minor, patch] = self.version;
        major * 10000 + minor * 100 + patch
    }

    pub fn version_major(&self) -> u32 {
        self.version[0]
    }

    fn find_include_dir() -> Result<path::PathBuf, Box<dyn error::Error>> {
        #[cfg(not(target_os = "windows"))]
        const DEFAULT_DIRS: &[&str] = &["/usr/include", "/usr/local/include"];
        #[cfg(target_os = "windows")]
        const DEFAULT_DIRS: &[&str] = &["C:/Program Files/NVIDIA/CUDNN/v8.x/include"];

        let overridden = env::var_os("CUDNN_INCLUDE_DIR").map(path::PathBuf::from);
        let cuda_include = find_cuda_helper::find_cuda_root().map(|root| root.join("include"));

        overridden
            .into_iter()
            .chain(cuda_include)
            .chain(DEFAULT_DIRS.iter().map(path::PathBuf::from))
            .find(|dir| dir.join("cudnn.h").is_file() && dir.join("cudnn_version.h").is_file())
            .ok_or_else(|| "cannot find the cuDNN headers, set CUDNN_INCLUDE_DIR".into())
    }

    fn read_define(header: &str, name: &str) -> Result<u32, Box<dyn error::Error>> {
        let value = header
            .lines()
            .filter_map(|line| line.strip_prefix("#define "))
            .find_map(|define| {
                let mut parts = define.split_whitespace();
                (parts.next() == Some(name)).then(|| parts.next()).flatten()
            })
            .ok_or_else(|| format!("cannot find {name} in cudnn_version.h"))?;
        Ok(value.parse()?)
    }
}
