use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

pub const DEFAULT_HOST_PROCESSES: [&str; 3] = ["code", "code - insiders", "cursor"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProcess {
    pub pid: u32,
    pub name: String,
}

/// 偵測正在執行、可能持有資料庫的宿主應用程式
#[derive(Debug, Clone)]
pub struct HostProbe {
    names: Vec<String>,
}

impl HostProbe {
    pub fn new(names: &[String]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    pub fn running(&self) -> Vec<HostProcess> {
        if self.names.is_empty() {
            return Vec::new();
        }

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let own_pid = std::process::id();

        let mut found: Vec<HostProcess> = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter_map(|(pid, process)| {
                let name = process.name().to_string_lossy().into_owned();
                self.matches(&name).then(|| HostProcess {
                    pid: pid.as_u32(),
                    name,
                })
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }

    /// 名稱完全相同、帶 `.exe`，或是 `<name> helper` 之類的子程序
    pub fn matches(&self, process_name: &str) -> bool {
        let lower = process_name.to_lowercase();
        self.names.iter().any(|name| {
            lower == *name
                || lower.strip_suffix(".exe") == Some(name.as_str())
                || lower
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with(' '))
        })
    }
}
