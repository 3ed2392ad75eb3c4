//! Optional syscall confinement for interpreter worker threads.
//!
//! The filter denies filesystem and socket syscalls with `EPERM` and applies
//! only to the calling thread, so a confined worker can still allocate and
//! talk to the rest of the process over channels.

use anyhow::Result;

/// Confine the current thread. Fails on platforms without seccomp support.
pub fn confine_current_thread() -> Result<()> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        linux::install_filter()
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        Err(anyhow::anyhow!("sandbox: worker confinement unavailable on this platform"))
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use anyhow::{anyhow, Context, Result};
    use libc::{c_uchar, c_uint, c_ulong, c_ushort};

    const EPERM: c_uint = 1;
    const SECCOMP_SET_MODE_FILTER: c_uint = 1;
    const SECCOMP_RET_ALLOW: c_uint = 0x7fff_0000;
    const SECCOMP_RET_ERRNO: c_uint = 0x0005_0000;
    const SECCOMP_RET_KILL: c_uint = 0x0000_0000;
    const AUDIT_ARCH_X86_64: c_uint = 0xc000_003e;

    const BPF_LD: c_ushort = 0x00;
    const BPF_W: c_ushort = 0x00;
    const BPF_ABS: c_ushort = 0x20;
    const BPF_JMP: c_ushort = 0x05;
    const BPF_JEQ: c_ushort = 0x10;
    const BPF_K: c_ushort = 0x00;
    const BPF_RET: c_ushort = 0x06;

    const SYSCALL_NR_OFFSET: c_uint = 0;
    const ARCH_OFFSET: c_uint = 4;

    // x86_64 syscall numbers; guest code has no business with any of them
    const DENIED_SYSCALLS: &[(c_uint, &str)] = &[
        (2, "open"),
        (4, "stat"),
        (5, "fstat"),
        (6, "lstat"),
        (21, "access"),
        (41, "socket"),
        (42, "connect"),
        (43, "accept"),
        (44, "sendto"),
        (45, "recvfrom"),
        (46, "sendmsg"),
        (47, "recvmsg"),
        (48, "shutdown"),
        (49, "bind"),
        (50, "listen"),
        (51, "getsockname"),
        (52, "getpeername"),
        (53, "socketpair"),
        (54, "setsockopt"),
        (55, "getsockopt"),
        (59, "execve"),
        (76, "truncate"),
        (77, "ftruncate"),
        (78, "getdents"),
        (80, "chdir"),
        (81, "fchdir"),
        (82, "rename"),
        (83, "mkdir"),
        (84, "rmdir"),
        (85, "creat"),
        (86, "link"),
        (87, "unlink"),
        (88, "symlink"),
        (89, "readlink"),
        (90, "chmod"),
        (91, "fchmod"),
        (92, "chown"),
        (93, "fchown"),
        (94, "lchown"),
        (217, "getdents64"),
        (257, "openat"),
        (258, "mkdirat"),
        (260, "fchownat"),
        (262, "newfstatat"),
        (263, "unlinkat"),
        (264, "renameat"),
        (265, "linkat"),
        (266, "symlinkat"),
        (267, "readlinkat"),
        (268, "fchmodat"),
        (269, "faccessat"),
        (288, "accept4"),
        (316, "renameat2"),
        (322, "execveat"),
        (437, "openat2"),
        (439, "faccessat2"),
    ];

    #[repr(C)]
    struct SockFilter {
        code: c_ushort,
        jt: c_uchar,
        jf: c_uchar,
        k: c_uint,
    }

    #[repr(C)]
    struct SockFprog {
        len: c_ushort,
        filter: *const SockFilter,
    }

    fn stmt(code: c_ushort, k: c_uint) -> SockFilter {
        SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    fn jump(code: c_ushort, k: c_uint, jt: c_uchar, jf: c_uchar) -> SockFilter {
        SockFilter { code, jt, jf, k }
    }

    fn build_filter() -> Vec<SockFilter> {
        let deny_errno = SECCOMP_RET_ERRNO | EPERM;
        let mut filters = Vec::with_capacity(DENIED_SYSCALLS.len() * 2 + 5);

        filters.push(stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET));
        filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0));
        filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL));

        filters.push(stmt(BPF_LD | BPF_W | BPF_ABS, SYSCALL_NR_OFFSET));
        for (nr, _) in DENIED_SYSCALLS {
            filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr, 0, 1));
            filters.push(stmt(BPF_RET | BPF_K, deny_errno));
        }
        filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        filters
    }

    pub(super) fn install_filter() -> Result<()> {
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as c_ulong,
                0 as c_ulong,
                0 as c_ulong,
                0 as c_ulong,
            )
        };
        if rc != 0 {
            return Err(anyhow!(std::io::Error::last_os_error()))
                .context("sandbox: PR_SET_NO_NEW_PRIVS failed");
        }

        let filters = build_filter();
        let prog = SockFprog {
            len: filters.len() as c_ushort,
            filter: filters.as_ptr(),
        };

        // no TSYNC flag: the filter binds this thread only
        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0 as c_uint,
                &prog as *const SockFprog,
            )
        };
        if rc != 0 {
            return Err(anyhow!(std::io::Error::last_os_error()))
                .context("sandbox: seccomp syscall failed");
        }

        log::debug!(
            "worker thread confined, {} syscalls denied",
            DENIED_SYSCALLS.len()
        );
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn filter_fits_in_one_program() {
            let filters = build_filter();
            assert!(filters.len() < usize::from(u16::MAX));
            assert_eq!(filters.len(), DENIED_SYSCALLS.len() * 2 + 5);
        }
    }
}
