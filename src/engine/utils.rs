use std::path::Path;

pub fn is_executable_present(path: &Path) -> bool {
    path.exists() && is_executable(path)
}

pub fn is_executable(path: &Path) -> bool {
    #[cfg(windows)]
    {
        path.extension().map_or(false, |ext| ext == "exe")
    }
    #[cfg(not(windows))]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).map_or(false, |metadata| {
            let permissions = metadata.permissions();
            permissions.mode() & 0o111 != 0
        })
    }
}
