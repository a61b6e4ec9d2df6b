//! Syscall shim layer: the bridge from guest SYSCALL instructions to
//! host-implemented OS services.
//!
//! Service NIDs resolve against an external directory at registration time;
//! each registered NID gets a dense SID (assigned in registration order) and
//! a shim that marshals arguments from the guest register file and stack,
//! invokes the host function, and writes the result back to `$v0`. The same
//! shim serves the host-callable path and the JIT's syscall helper.

use std::collections::HashMap;

use crate::cpu::Allegrex;
use crate::mem::{mask_address, MemoryMap};

pub const SYSCALL_TABLE_SIZE: usize = 1024;

/// Argument registers a0..a3, then the guest stack at sp+16.
const ARG_REGS: [usize; 4] = [4, 5, 6, 7];
const REG_SP: usize = 29;
const REG_V0: usize = 2;

/// How one parameter is marshalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Plain 32-bit word, passed through.
    Word,
    /// Guest pointer: the mirror bits are folded and the address is checked
    /// against the memory map before the service sees it.
    Ptr,
}

/// Everything a service implementation may touch.
pub struct HleContext<'a> {
    pub cpu: &'a mut Allegrex,
    pub mem: &'a mut MemoryMap,
}

pub type ServiceFn = fn(&mut HleContext<'_>, &[u32]) -> u32;

/// A resolved service: host entry point plus its argument descriptor.
#[derive(Clone, Copy)]
pub struct ServiceEntry {
    pub func: ServiceFn,
    pub args: &'static [ArgKind],
}

/// The HLE service directory (implemented by the BIOS layer, external to
/// this core).
pub trait ServiceDirectory {
    fn resolve(&self, nid: u32) -> Option<ServiceEntry>;
}

/// One registered syscall. The same shim serves host callers and generated
/// code; there is no separate fast-path stub to emit.
struct Shim {
    nid: u32,
    func: ServiceFn,
    args: &'static [ArgKind],
}

impl Shim {
    fn invoke(&self, cpu: &mut Allegrex, mem: &mut MemoryMap) {
        let mut args = [0u32; 16];
        let count = self.args.len().min(args.len());
        for (idx, kind) in self.args.iter().take(count).enumerate() {
            let raw = if idx < ARG_REGS.len() {
                cpu.ctx.gpr[ARG_REGS[idx]]
            } else {
                // o32: the fifth and later words live on the caller's stack.
                let slot = cpu.ctx.gpr[REG_SP]
                    .wrapping_add(16)
                    .wrapping_add(((idx - ARG_REGS.len()) as u32) * 4);
                mem.read_u32(slot).unwrap_or(0)
            };
            args[idx] = match kind {
                ArgKind::Word => raw,
                ArgKind::Ptr => {
                    let masked = mask_address(raw);
                    if raw != 0 && mem.translate(masked, 1).is_err() {
                        log::warn!(
                            "syscall {:#010X}: pointer argument {} outside guest memory ({:#010X})",
                            self.nid,
                            idx,
                            raw
                        );
                    }
                    masked
                }
            };
        }

        let mut hle = HleContext { cpu: &mut *cpu, mem: &mut *mem };
        let result = (self.func)(&mut hle, &args[..count]);
        cpu.ctx.gpr[REG_V0] = result;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HleError {
    /// SID not backed by a registered shim. The dispatcher turns this into a
    /// guest syscall exception.
    UnknownSid(u32),
}

/// Fixed-size syscall table indexed by SID.
pub struct SyscallTable {
    slots: Vec<Option<Shim>>,
    counts: Vec<u64>,
    next_sid: usize,
    unknown_logged: bool,
}

impl SyscallTable {
    pub fn new() -> Self {
        Self {
            slots: (0..SYSCALL_TABLE_SIZE).map(|_| None).collect(),
            counts: vec![0; SYSCALL_TABLE_SIZE],
            next_sid: 0,
            unknown_logged: false,
        }
    }

    /// Register the service with the given NID. Returns the assigned SID, or
    /// -1 when the directory does not know the NID or the table is full.
    pub fn register(&mut self, nid: u32, directory: &dyn ServiceDirectory) -> i32 {
        let Some(entry) = directory.resolve(nid) else {
            log::info!("unknown syscall NID {:#010X}", nid);
            return -1;
        };
        if self.next_sid >= SYSCALL_TABLE_SIZE {
            log::error!("syscall table full; cannot register NID {:#010X}", nid);
            return -1;
        }
        let sid = self.next_sid;
        self.next_sid += 1;
        self.slots[sid] = Some(Shim { nid, func: entry.func, args: entry.args });
        sid as i32
    }

    pub fn len(&self) -> usize {
        self.next_sid
    }

    pub fn is_empty(&self) -> bool {
        self.next_sid == 0
    }

    pub fn nid_of(&self, sid: u32) -> Option<u32> {
        self.slots.get(sid as usize)?.as_ref().map(|s| s.nid)
    }

    pub fn call_count(&self, sid: u32) -> u64 {
        self.counts.get(sid as usize).copied().unwrap_or(0)
    }

    /// Dispatch the shim for `sid`: marshal arguments, call the service,
    /// store the result in `$v0`.
    pub fn invoke(
        &mut self,
        sid: u32,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
    ) -> Result<(), HleError> {
        let Some(shim) = self.slots.get(sid as usize).and_then(Option::as_ref) else {
            if !self.unknown_logged {
                log::error!("syscall with unregistered SID {}", sid);
                self.unknown_logged = true;
            }
            return Err(HleError::UnknownSid(sid));
        };
        self.counts[sid as usize] += 1;
        shim.invoke(cpu, mem);
        Ok(())
    }

    /// Per-SID call counts for the statistics dump: (sid, nid, count).
    pub fn stats(&self) -> impl Iterator<Item = (u32, u32, u64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(sid, slot)| {
                let shim = slot.as_ref()?;
                let count = self.counts[sid];
                (count > 0).then_some((sid as u32, shim.nid, count))
            })
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A module export the guest registered: NID to guest address.
#[derive(Debug, Clone)]
pub struct ModuleExport {
    pub nid: u32,
    pub address: u32,
    pub is_system: bool,
}

/// A loaded guest module's export list.
#[derive(Debug, Clone, Default)]
pub struct ExportModule {
    pub name: String,
    pub exports: Vec<ModuleExport>,
}

/// NID → guest address map used when the guest resolves imports of its own
/// modules.
#[derive(Default)]
pub struct UserExports {
    map: HashMap<u32, u32>,
}

impl UserExports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a module's user exports; system exports resolve through the
    /// syscall table instead.
    pub fn register_module(&mut self, module: &ExportModule) {
        for export in &module.exports {
            if export.is_system {
                continue;
            }
            self.map.insert(export.nid, export.address);
        }
    }

    /// Address of the export with the given NID, or 0 if unknown.
    pub fn lookup(&self, nid: u32) -> u32 {
        self.map.get(&nid).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::RAM_BASE;

    struct TestDirectory;

    fn svc_fixed(_ctx: &mut HleContext<'_>, _args: &[u32]) -> u32 {
        0x1234
    }

    fn svc_sum(_ctx: &mut HleContext<'_>, args: &[u32]) -> u32 {
        args.iter().sum()
    }

    fn svc_read_ptr(ctx: &mut HleContext<'_>, args: &[u32]) -> u32 {
        ctx.mem.read_u32(args[0]).unwrap_or(0xFFFF_FFFF)
    }

    impl ServiceDirectory for TestDirectory {
        fn resolve(&self, nid: u32) -> Option<ServiceEntry> {
            match nid {
                0x1111_1111 => Some(ServiceEntry { func: svc_fixed, args: &[] }),
                0x2222_2222 => Some(ServiceEntry {
                    func: svc_sum,
                    args: &[
                        ArgKind::Word,
                        ArgKind::Word,
                        ArgKind::Word,
                        ArgKind::Word,
                        ArgKind::Word,
                        ArgKind::Word,
                    ],
                }),
                0x3333_3333 => Some(ServiceEntry { func: svc_read_ptr, args: &[ArgKind::Ptr] }),
                _ => None,
            }
        }
    }

    #[test]
    fn sids_are_assigned_in_registration_order() {
        let mut table = SyscallTable::new();
        assert_eq!(table.register(0x1111_1111, &TestDirectory), 0);
        assert_eq!(table.register(0x2222_2222, &TestDirectory), 1);
        assert_eq!(table.register(0xDEAD_BEEF, &TestDirectory), -1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.nid_of(0), Some(0x1111_1111));
    }

    #[test]
    fn invoke_writes_result_to_v0() {
        let mut table = SyscallTable::new();
        let sid = table.register(0x1111_1111, &TestDirectory) as u32;
        let mut cpu = Allegrex::new();
        let mut mem = MemoryMap::new();

        table.invoke(sid, &mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.ctx.gpr[2], 0x1234);
        assert_eq!(table.call_count(sid), 1);
    }

    #[test]
    fn arguments_come_from_registers_then_stack() {
        let mut table = SyscallTable::new();
        let sid = table.register(0x2222_2222, &TestDirectory) as u32;
        let mut cpu = Allegrex::new();
        let mut mem = MemoryMap::new();

        cpu.ctx.gpr[4] = 1; // a0
        cpu.ctx.gpr[5] = 2; // a1
        cpu.ctx.gpr[6] = 3; // a2
        cpu.ctx.gpr[7] = 4; // a3
        cpu.ctx.gpr[29] = RAM_BASE + 0x1000; // sp
        mem.write_u32(RAM_BASE + 0x1010, 10).unwrap(); // arg 4
        mem.write_u32(RAM_BASE + 0x1014, 20).unwrap(); // arg 5

        table.invoke(sid, &mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.ctx.gpr[2], 1 + 2 + 3 + 4 + 10 + 20);
    }

    #[test]
    fn pointer_arguments_fold_mirror_bits() {
        let mut table = SyscallTable::new();
        let sid = table.register(0x3333_3333, &TestDirectory) as u32;
        let mut cpu = Allegrex::new();
        let mut mem = MemoryMap::new();

        mem.write_u32(RAM_BASE + 0x40, 0xCAFE_BABE).unwrap();
        cpu.ctx.gpr[4] = 0x4800_0040; // uncached mirror
        table.invoke(sid, &mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.ctx.gpr[2], 0xCAFE_BABE);
    }

    #[test]
    fn unknown_sid_is_an_error() {
        let mut table = SyscallTable::new();
        let mut cpu = Allegrex::new();
        let mut mem = MemoryMap::new();
        assert_eq!(
            table.invoke(99, &mut cpu, &mut mem),
            Err(HleError::UnknownSid(99))
        );
    }

    #[test]
    fn user_exports_skip_system_entries() {
        let mut exports = UserExports::new();
        exports.register_module(&ExportModule {
            name: "game_module".into(),
            exports: vec![
                ModuleExport { nid: 0xAAAA_0001, address: 0x0880_1000, is_system: false },
                ModuleExport { nid: 0xAAAA_0002, address: 0x0880_2000, is_system: true },
            ],
        });
        assert_eq!(exports.lookup(0xAAAA_0001), 0x0880_1000);
        assert_eq!(exports.lookup(0xAAAA_0002), 0);
        assert_eq!(exports.lookup(0xffff_ffff), 0);
    }
}
