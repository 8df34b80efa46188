//! Loading and driving the XDP filter program through libbpf.
//!
//! The object file must define an XDP program and three maps:
//!
//! * a hash map from [`MaskedKey`] (mask, then masked key) to a `u32` rule marker,
//! * an array of [`MAX_MASKS`] [`RuleKey`] masks, an all-zero mask ending the list,
//! * an `XSKMAP` from queue index to AF_XDP socket.
use std::collections::HashSet;
use std::ffi::{CString, NulError};
use std::io;
use std::os::raw::{c_int, c_void};
use std::path::PathBuf;

use libbpf_sys::{
    bpf_map_delete_elem, bpf_map_update_elem, bpf_object, bpf_object__close,
    bpf_object__find_map_fd_by_name, bpf_object__find_program_by_name, bpf_object__load,
    bpf_object__next_program, bpf_object__open_file, bpf_program__fd, bpf_xdp_attach,
    bpf_xdp_detach, XDP_FLAGS_DRV_MODE, XDP_FLAGS_SKB_MODE, XDP_FLAGS_UPDATE_IF_NOEXIST,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AttachMode, ProgramConfig};
use crate::filter::{MaskedKey, RuleKey, RuleTable, RuleView, MAX_MASKS};
use crate::socket::Socket;
use crate::util::if_index;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("name contains a NUL byte: {0}")]
    InvalidName(#[from] NulError),

    #[error("opening {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("loading {path}: {source}")]
    Load { path: PathBuf, source: io::Error },

    #[error("no XDP program {0} in the object")]
    ProgramNotFound(String),

    #[error("no map {0} in the object")]
    MapNotFound(String),

    #[error("no such interface: {0}")]
    NoSuchInterface(String),

    #[error("attaching to {if_name}: {source}")]
    Attach { if_name: String, source: io::Error },

    #[error("updating map {map}: {source}")]
    MapUpdate { map: String, source: io::Error },

    #[error("socket is not bound to an interface queue")]
    NotXdpSocket,

    #[error("{0} masks do not fit in the program's mask array")]
    TooManyMasks(usize),
}

fn neg_errno(ret: c_int) -> io::Error {
    if ret < 0 {
        io::Error::from_raw_os_error(-ret)
    } else {
        io::Error::last_os_error()
    }
}

/// A loaded XDP filter program, detached and unloaded on drop.
#[derive(Debug)]
pub struct XdpProgram {
    obj: *mut bpf_object,
    prog_fd: c_int,
    config: ProgramConfig,
    rule_map_fd: c_int,
    mask_map_fd: c_int,
    xsk_map_fd: c_int,
    /// Interface index and mode flags
    attached: Option<(c_int, u32)>,
    synced: HashSet<MaskedKey>,
}

// The object is only touched through &mut self or on drop
unsafe impl Send for XdpProgram {}

/// A socket's entry in the program's socket map, removed on drop.
#[derive(Debug)]
pub struct Registration {
    map_fd: c_int,
    queue: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let key = &self.queue as *const u32 as *const c_void;
        let r = unsafe { bpf_map_delete_elem(self.map_fd, key) };
        if r != 0 {
            warn!(
                "removing socket for queue {} failed: {}",
                self.queue,
                neg_errno(r)
            );
        }

        unsafe { libc::close(self.map_fd) };
    }
}

impl XdpProgram {
    /// Open and load the object named by `config`, and resolve its program and maps.
    pub fn load(config: &ProgramConfig) -> Result<XdpProgram, ProgramError> {
        let path = CString::new(config.path.to_string_lossy().as_bytes())?;

        let obj = unsafe { bpf_object__open_file(path.as_ptr(), std::ptr::null()) };
        if obj.is_null() {
            return Err(ProgramError::Open {
                path: config.path.clone(),
                source: io::Error::last_os_error(),
            });
        }

        // From here on drop closes the object
        let mut program = XdpProgram {
            obj,
            prog_fd: -1,
            config: config.clone(),
            rule_map_fd: -1,
            mask_map_fd: -1,
            xsk_map_fd: -1,
            attached: None,
            synced: HashSet::new(),
        };

        let r = unsafe { bpf_object__load(obj) };
        if r != 0 {
            return Err(ProgramError::Load {
                path: config.path.clone(),
                source: neg_errno(r),
            });
        }

        let prog = match &config.prog_name {
            Some(name) => {
                let name_c = CString::new(name.as_str())?;
                unsafe { bpf_object__find_program_by_name(obj, name_c.as_ptr()) }
            }
            None => unsafe { bpf_object__next_program(obj, std::ptr::null_mut()) },
        };
        if prog.is_null() {
            let name = config.prog_name.clone().unwrap_or_else(|| "(first)".to_string());
            return Err(ProgramError::ProgramNotFound(name));
        }
        program.prog_fd = unsafe { bpf_program__fd(prog) };

        program.rule_map_fd = program.map_fd(&config.rule_map)?;
        program.mask_map_fd = program.map_fd(&config.mask_map)?;
        program.xsk_map_fd = program.map_fd(&config.xsk_map)?;

        info!("loaded XDP program from {}", config.path.display());

        Ok(program)
    }

    fn map_fd(&self, name: &str) -> Result<c_int, ProgramError> {
        let name_c = CString::new(name)?;

        let fd = unsafe { bpf_object__find_map_fd_by_name(self.obj, name_c.as_ptr()) };
        if fd < 0 {
            return Err(ProgramError::MapNotFound(name.to_string()));
        }

        Ok(fd)
    }

    /// Attach the program to `if_name`. Fails if the interface already runs an XDP program.
    pub fn attach(&mut self, if_name: &str) -> Result<(), ProgramError> {
        let ifindex = match if_index(if_name) {
            Some(idx) => idx,
            None => return Err(ProgramError::NoSuchInterface(if_name.to_string())),
        };

        let mode = match self.config.mode {
            AttachMode::Skb => XDP_FLAGS_SKB_MODE,
            AttachMode::Drv => XDP_FLAGS_DRV_MODE,
        };
        let flags = XDP_FLAGS_UPDATE_IF_NOEXIST | mode;

        let r =
            unsafe { bpf_xdp_attach(ifindex as c_int, self.prog_fd, flags, std::ptr::null()) };
        if r != 0 {
            return Err(ProgramError::Attach {
                if_name: if_name.to_string(),
                source: neg_errno(r),
            });
        }

        info!(
            "attached XDP program to {} ({:?} mode)",
            if_name, self.config.mode
        );
        self.attached = Some((ifindex as c_int, mode));

        Ok(())
    }

    /// Write `table` into the rule and mask maps, removing rules that are no longer in it.
    pub fn sync_rules(&mut self, table: &RuleTable) -> Result<(), ProgramError> {
        let masks = table.masks();
        if masks.len() > MAX_MASKS {
            return Err(ProgramError::TooManyMasks(masks.len()));
        }

        let mut present = HashSet::new();
        for (key, marker) in table.entries() {
            let r = unsafe {
                bpf_map_update_elem(
                    self.rule_map_fd,
                    key as *const MaskedKey as *const c_void,
                    &marker.0 as *const u32 as *const c_void,
                    0,
                )
            };
            if r != 0 {
                return Err(self.update_error(&self.config.rule_map, r));
            }
            present.insert(*key);
        }

        for stale in self.synced.difference(&present) {
            let r = unsafe {
                bpf_map_delete_elem(self.rule_map_fd, stale as *const MaskedKey as *const c_void)
            };
            if r != 0 {
                warn!("removing rule {:?} failed: {}", stale, neg_errno(r));
            }
        }
        self.synced = present;

        for slot in 0..MAX_MASKS as u32 {
            let mask = masks.get(slot as usize).copied().unwrap_or_default();
            let r = unsafe {
                bpf_map_update_elem(
                    self.mask_map_fd,
                    &slot as *const u32 as *const c_void,
                    &mask as *const RuleKey as *const c_void,
                    0,
                )
            };
            if r != 0 {
                return Err(self.update_error(&self.config.mask_map, r));
            }
        }

        info!("synced {} rules over {} masks", table.len(), masks.len());
        Ok(())
    }

    /// Point the socket map entry of `socket`'s queue at `socket`. The entry is removed when
    /// the socket is closed.
    pub fn register(&self, socket: &mut Socket) -> Result<(), ProgramError> {
        let (fd, queue) = match (socket.fd(), socket.queue()) {
            (Some(fd), Some(queue)) => (fd, queue),
            _ => return Err(ProgramError::NotXdpSocket),
        };

        let r = unsafe {
            bpf_map_update_elem(
                self.xsk_map_fd,
                &queue as *const u32 as *const c_void,
                &fd as *const c_int as *const c_void,
                0,
            )
        };
        if r != 0 {
            return Err(self.update_error(&self.config.xsk_map, r));
        }

        // Own a map reference so the entry can be removed even after the program is gone
        let map_fd = unsafe { libc::dup(self.xsk_map_fd) };
        if map_fd < 0 {
            return Err(ProgramError::MapUpdate {
                map: self.config.xsk_map.clone(),
                source: io::Error::last_os_error(),
            });
        }

        socket.set_registration(Registration { map_fd, queue });
        info!("registered socket for queue {}", queue);

        Ok(())
    }

    fn update_error(&self, map: &str, ret: c_int) -> ProgramError {
        ProgramError::MapUpdate {
            map: map.to_string(),
            source: neg_errno(ret),
        }
    }
}

impl Drop for XdpProgram {
    fn drop(&mut self) {
        if let Some((ifindex, flags)) = self.attached.take() {
            let r = unsafe { bpf_xdp_detach(ifindex, flags, std::ptr::null()) };
            if r != 0 {
                warn!("detaching XDP program failed: {}", neg_errno(r));
            }
        }

        unsafe { bpf_object__close(self.obj) };
    }
}
