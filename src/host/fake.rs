//! A scripted, recording [`Host`] for tests.
//!
//! Models just enough kernel behaviour to drive the provisioning stages: loop
//! allocation, partition nodes appearing under the kernel or device-mapper naming
//! scheme, a btrfs subvolume table, and a mount table that refuses to unmount a
//! parent while children are still mounted.
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use super::Host;
use crate::{
    disks::partition::{ESP_TYPE, LINUX_FS_TYPE, SECTOR_SIZE},
    error::ProvisionError,
    util::{
        cmd::{Cmd, CmdOutput},
        fs::partition_node,
    },
};

type Hook = Box<dyn Fn(&Cmd) -> Option<CmdOutput> + Send>;

/// Which partition nodes show up after a table re-read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeMode {
    /// `/dev/loop0p1` appears on its own
    #[default]
    Kernel,
    /// Nothing appears until `kpartx` maps `/dev/mapper/loop0p1`
    Mapper,
    /// Nothing ever appears
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Run(String),
    Mount { source: PathBuf, target: PathBuf, options: String },
    Remount(PathBuf),
    Umount(PathBuf),
}

#[derive(Debug, Clone)]
struct GptEntry {
    start: u64,
    size: u64,
    kind: String,
}

#[derive(Default)]
struct State {
    ops: Vec<Op>,
    mounted: Vec<PathBuf>,
    nodes: BTreeSet<PathBuf>,
    attached: BTreeMap<PathBuf, PathBuf>,
    gpt: Vec<GptEntry>,
    subvolumes: Vec<(u64, String)>,
    default_subvolume: u64,
    fail_mount: Option<PathBuf>,
    slept: Duration,
}

pub struct FakeHost {
    state: Mutex<State>,
    hooks: Mutex<Vec<(String, Hook)>>,
    mode: NodeMode,
    device_size: u64,
    free_space: u64,
    privileged: bool,
    missing_programs: BTreeSet<String>,
    interrupted: AtomicBool,
    interrupt_after: Mutex<Option<String>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new(NodeMode::Kernel)
    }
}

impl FakeHost {
    pub fn new(mode: NodeMode) -> Self {
        Self {
            state: Mutex::new(State {
                default_subvolume: 5,
                ..State::default()
            }),
            hooks: Mutex::default(),
            mode,
            device_size: 4 * 1024 * 1024 * 1024,
            free_space: u64::MAX,
            privileged: true,
            missing_programs: BTreeSet::new(),
            interrupted: AtomicBool::new(false),
            interrupt_after: Mutex::default(),
        }
    }

    pub const fn with_free_space(mut self, bytes: u64) -> Self {
        self.free_space = bytes;
        self
    }

    pub const fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    pub fn without_program(mut self, name: &str) -> Self {
        self.missing_programs.insert(name.to_owned());
        self
    }

    /// Answer every invocation of `program` with `f` instead of the built-in model.
    /// `f` returning `None` falls through to the model.
    pub fn on(&self, program: &str, f: impl Fn(&Cmd) -> Option<CmdOutput> + Send + 'static) {
        self.hooks.lock().push((program.to_owned(), Box::new(f)));
    }

    /// Make every invocation of `program` exit 1.
    pub fn fail(&self, program: &str) {
        self.on(program, |_| Some(CmdOutput::failed(1, "injected failure")));
    }

    pub fn fail_mount_at(&self, target: &Path) {
        self.state.lock().fail_mount = Some(target.to_path_buf());
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Raise the interrupt flag as soon as `program` has finished running,
    /// like a signal landing while it was in flight.
    pub fn interrupt_after(&self, program: &str) {
        *self.interrupt_after.lock() = Some(program.to_owned());
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    /// Command lines run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Run(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    pub fn mounts(&self) -> Vec<PathBuf> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Mount { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn umounts(&self) -> Vec<PathBuf> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Umount(target) => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn currently_mounted(&self) -> Vec<PathBuf> {
        self.state.lock().mounted.clone()
    }

    pub fn attached(&self) -> Vec<PathBuf> {
        self.state.lock().attached.keys().cloned().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.state.lock().gpt.len()
    }

    pub fn subvolumes(&self) -> Vec<String> {
        self.state.lock().subvolumes.iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn default_subvolume(&self) -> Option<String> {
        let state = self.state.lock();
        (state.subvolumes.iter())
            .find(|(id, _)| *id == state.default_subvolume)
            .map(|(_, n)| n.clone())
    }

    pub fn slept(&self) -> Duration {
        self.state.lock().slept
    }

    fn last_lba(&self) -> u64 {
        self.device_size / SECTOR_SIZE - 34
    }

    fn materialize(&self, state: &mut State, mapper: bool) -> String {
        let mut out = String::new();
        let devices: Vec<PathBuf> = state.attached.keys().cloned().collect();
        for dev in devices {
            for (i, part) in state.gpt.clone().iter().enumerate() {
                let n = i + 1;
                if mapper {
                    let name = format!("{}p{n}", dev.file_name().unwrap().to_string_lossy());
                    out += &format!("add map {name} (253:{i}): 0 {} linear 7:0 {}\n", part.size, part.start);
                    state.nodes.insert(Path::new("/dev/mapper").join(name));
                } else {
                    state.nodes.insert(partition_node(&dev, n as u32));
                }
            }
        }
        out
    }

    fn model(&self, cmd: &Cmd) -> CmdOutput {
        let mut state = self.state.lock();
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        let last = args.last().copied().unwrap_or_default();

        match (cmd.program.as_str(), args.as_slice()) {
            ("losetup", ["--find"]) => CmdOutput::ok(format!("/dev/loop{}\n", state.attached.len())),
            ("losetup", ["--find", "--show", "--partscan", image]) => {
                let dev = PathBuf::from(format!("/dev/loop{}", state.attached.len()));
                state.attached.insert(dev.clone(), PathBuf::from(image));
                state.nodes.insert(dev.clone());
                CmdOutput::ok(format!("{}\n", dev.display()))
            }
            ("losetup", ["-d", dev]) => {
                if state.attached.remove(Path::new(dev)).is_none() {
                    return CmdOutput::failed(1, format!("losetup: {dev}: detach failed: No such device or address"));
                }
                state.nodes.retain(|n| !n.to_string_lossy().starts_with(dev));
                CmdOutput::ok("")
            }
            ("blockdev", ["--getsize64", _]) => CmdOutput::ok(format!("{}\n", self.device_size)),
            ("blockdev", ["--rereadpt", _]) | ("partprobe", [_]) => {
                if self.mode == NodeMode::Kernel {
                    self.materialize(&mut state, false);
                }
                CmdOutput::ok("")
            }
            ("sfdisk", ["-J", dev]) => {
                let partitions: Vec<_> = (state.gpt.iter().enumerate())
                    .map(|(i, p)| {
                        serde_json::json!({
                            "node": partition_node(Path::new(dev), i as u32 + 1),
                            "start": p.start,
                            "size": p.size,
                            "type": p.kind,
                        })
                    })
                    .collect();
                let table = serde_json::json!({
                    "partitiontable": {
                        "label": "gpt",
                        "device": dev,
                        "unit": "sectors",
                        "firstlba": 34,
                        "lastlba": self.last_lba(),
                        "sectorsize": SECTOR_SIZE,
                        "partitions": partitions,
                    }
                });
                CmdOutput::ok(table.to_string())
            }
            ("sfdisk", _) => {
                let script = cmd.stdin.clone().unwrap_or_default();
                state.gpt = self.parse_script(&script);
                CmdOutput::ok("")
            }
            ("kpartx", ["-avs", _]) => {
                if self.mode == NodeMode::Mapper {
                    CmdOutput::ok(self.materialize(&mut state, true))
                } else {
                    CmdOutput::ok("")
                }
            }
            ("kpartx", ["-d", _]) => {
                state.nodes.retain(|n| !n.starts_with("/dev/mapper"));
                CmdOutput::ok("")
            }
            ("mkfs.fat" | "mkfs.btrfs" | "blkid", _) if !state.nodes.contains(Path::new(last)) => {
                CmdOutput::failed(2, format!("{last}: No such file or directory"))
            }
            ("blkid", _) => match crate::util::fs::partition_number(last) {
                Some(1) => CmdOutput::ok("4E2F-1A3B\n"),
                _ => CmdOutput::ok("0b7e4c1a-2d3f-4a5b-9c8d-7e6f5a4b3c2d\n"),
            },
            ("btrfs", ["subvolume", "create", path]) => {
                let name = Path::new(path).file_name().unwrap().to_string_lossy().into_owned();
                let id = 256 + state.subvolumes.len() as u64;
                state.subvolumes.push((id, name));
                CmdOutput::ok(format!("Create subvolume '{path}'\n"))
            }
            ("btrfs", ["subvolume", "list", _]) => CmdOutput::ok(
                (state.subvolumes.iter())
                    .map(|(id, name)| format!("ID {id} gen 7 top level 5 path {name}\n"))
                    .collect::<String>(),
            ),
            ("btrfs", ["subvolume", "set-default", id, _]) => {
                let id: u64 = id.parse().unwrap();
                if !state.subvolumes.iter().any(|(i, _)| *i == id) {
                    return CmdOutput::failed(1, "ERROR: unable to set a default subvolume");
                }
                state.default_subvolume = id;
                CmdOutput::ok("")
            }
            ("btrfs", ["subvolume", "get-default", _]) => {
                let default = state.default_subvolume;
                match state.subvolumes.iter().find(|(i, _)| *i == default) {
                    Some((id, name)) => CmdOutput::ok(format!("ID {id} gen 7 top level 5 path {name}\n")),
                    None => CmdOutput::ok("ID 5 (FS_TREE)\n"),
                }
            }
            _ => CmdOutput::ok(""),
        }
    }

    fn parse_script(&self, script: &str) -> Vec<GptEntry> {
        script
            .lines()
            .filter(|l| l.starts_with("start="))
            .map(|line| {
                let fields: BTreeMap<&str, &str> = line
                    .split(',')
                    .filter_map(|kv| kv.trim().split_once('='))
                    .collect();
                let start: u64 = fields["start"].parse().unwrap();
                let size = fields
                    .get("size")
                    .map_or(self.last_lba() - start + 1, |s| s.parse().unwrap());
                let kind = match fields.get("type") {
                    Some(&"U") => ESP_TYPE,
                    _ => LINUX_FS_TYPE,
                };
                GptEntry {
                    start,
                    size,
                    kind: kind.to_string().to_uppercase(),
                }
            })
            .collect()
    }
}

impl Host for FakeHost {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput, ProvisionError> {
        self.state.lock().ops.push(Op::Run(cmd.to_string()));
        if self.missing_programs.contains(&cmd.program) {
            return Err(ProvisionError::ExternalToolFailure {
                command: cmd.to_string(),
                status: 127,
                output: format!("{}: command not found", cmd.program),
            });
        }
        let hooked = (self.hooks.lock().iter())
            .filter(|(program, _)| *program == cmd.program)
            .find_map(|(_, f)| f(cmd));
        let out = hooked.unwrap_or_else(|| self.model(cmd));
        if self.interrupt_after.lock().as_deref() == Some(cmd.program.as_str()) {
            self.interrupt();
        }
        Ok(out)
    }

    fn mount(&self, source: &Path, target: &Path, _fstype: &str, options: &str) -> std::io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_mount.as_deref() == Some(target) {
            return Err(std::io::Error::from_raw_os_error(nix::libc::EIO));
        }
        if !target.is_dir() || !state.nodes.contains(source) {
            return Err(std::io::Error::from_raw_os_error(nix::libc::ENOENT));
        }
        state.mounted.push(target.to_path_buf());
        state.ops.push(Op::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.to_owned(),
        });
        Ok(())
    }

    fn remount_readonly(&self, target: &Path) -> std::io::Result<()> {
        let mut state = self.state.lock();
        if !state.mounted.iter().any(|m| m == target) {
            return Err(std::io::Error::from_raw_os_error(nix::libc::EINVAL));
        }
        state.ops.push(Op::Remount(target.to_path_buf()));
        Ok(())
    }

    fn umount(&self, target: &Path) -> std::io::Result<()> {
        let mut state = self.state.lock();
        let Some(pos) = state.mounted.iter().position(|m| m == target) else {
            return Err(std::io::Error::from_raw_os_error(nix::libc::EINVAL));
        };
        if (state.mounted.iter()).any(|m| m != target && m.starts_with(target)) {
            return Err(std::io::Error::from_raw_os_error(nix::libc::EBUSY));
        }
        state.mounted.remove(pos);
        state.ops.push(Op::Umount(target.to_path_buf()));
        Ok(())
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.state.lock().nodes.contains(path)
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        (!self.missing_programs.contains(name)).then(|| Path::new("/usr/bin").join(name))
    }

    fn available_space(&self, _dir: &Path) -> std::io::Result<u64> {
        Ok(self.free_space)
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn sleep(&self, duration: Duration) {
        self.state.lock().slept += duration;
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}
