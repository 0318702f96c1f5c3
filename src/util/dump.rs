// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error dump files written before the process goes down

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::NbcResult;

/// Host name of this machine, or `"unknown"` if it cannot be read
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Path of the dump file for this process inside `dir`
pub fn dump_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.{}.dump.txt", hostname(), std::process::id()))
}

/// Write `report` to `<dir>/<hostname>.<pid>.dump.txt`.
pub fn write_error_dump(dir: &Path, report: &str) -> NbcResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dump_path(dir);
    fs::write(&path, report)?;
    Ok(path)
}
