//! Output-file plumbing. The image is written to a temporary file next to the real output and
//! renamed into place, so a failed link never leaves a half-written executable behind and a
//! successful one replaces the old file atomically.

use crate::error::Context as _;
use crate::error::Result;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct OutputFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    committed: bool,
}

impl OutputFile {
    pub(crate) fn new(path: &Path) -> Self {
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        Self {
            final_path: path.to_owned(),
            temp_path: path.with_file_name(temp_name),
            committed: false,
        }
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result {
        std::fs::write(&self.temp_path, bytes)
            .with_context(|| format!("failed to write {}", self.temp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&self.temp_path, std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("failed to chmod {}", self.temp_path.display()))?;
        }

        std::fs::rename(&self.temp_path, &self.final_path)
            .with_context(|| format!("failed to rename output to {}", self.final_path.display()))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Writes a ustar archive containing all input files, for `--reproduce`.
pub(crate) fn write_repro_tar(tar_path: &Path, input_paths: &[PathBuf]) -> Result {
    const BLOCK: usize = 512;
    let mut out = Vec::new();

    for path in input_paths {
        let data = std::fs::read(path)
            .with_context(|| format!("cannot reread {} for --reproduce", path.display()))?;

        let mut header = [0u8; BLOCK];
        let name = path.to_string_lossy();
        let name = name.trim_start_matches('/');
        let name_bytes = &name.as_bytes()[..name.len().min(99)];
        header[..name_bytes.len()].copy_from_slice(name_bytes);
        header[100..107].copy_from_slice(b"0000644");
        header[108..115].copy_from_slice(b"0000000");
        header[116..123].copy_from_slice(b"0000000");
        header[124..135].copy_from_slice(format!("{:011o}", data.len()).as_bytes());
        header[136..147].copy_from_slice(b"00000000000");
        header[156] = b'0';
        header[257..262].copy_from_slice(b"ustar");
        header[263..265].copy_from_slice(b"00");

        // Checksum is computed with the checksum field itself set to spaces.
        header[148..156].copy_from_slice(b"        ");
        let checksum: u32 = header.iter().map(|&b| u32::from(b)).sum();
        header[148..154].copy_from_slice(format!("{checksum:06o}").as_bytes());
        header[154] = 0;
        header[155] = b' ';

        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        out.resize(out.len().next_multiple_of(BLOCK), 0);
    }

    // Two zero blocks terminate the archive.
    out.resize(out.len() + 2 * BLOCK, 0);
    std::fs::write(tar_path, out)
        .with_context(|| format!("failed to write {}", tar_path.display()))
}
