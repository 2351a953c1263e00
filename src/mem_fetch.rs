use super::{address, instruction::WarpInstruction, mcu, mem_sub_partition};
use bitvec::BitArr;
use serde::{Deserialize, Serialize};

/// Control bytes of a read request or reply (address + tags).
pub const READ_PACKET_SIZE: u32 = 8;

/// Control bytes of a write request (address + tags).
pub const WRITE_PACKET_SIZE: u32 = 8;

/// Additional control bytes carrying the write byte mask.
pub const WRITE_MASK_SIZE: u32 = 8;

pub type ByteMask = BitArr!(for mem_sub_partition::MAX_MEMORY_ACCESS_SIZE as usize);
pub type SectorMask = BitArr!(for mem_sub_partition::NUM_SECTORS, in u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    READ_REQUEST,
    WRITE_REQUEST,
    READ_REPLY,
    WRITE_ACK,
}

/// Where a fetch currently sits; each transition records the cycle it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    INITIALIZED,
    IN_L1I_MISS_QUEUE,
    IN_L1D_MISS_QUEUE,
    IN_L1T_MISS_QUEUE,
    IN_L1C_MISS_QUEUE,
    IN_ICNT_TO_MEM,
    IN_PARTITION_ROP_DELAY,
    IN_PARTITION_ICNT_TO_L2_QUEUE,
    IN_PARTITION_L2_TO_DRAM_QUEUE,
    IN_PARTITION_DRAM,
    IN_PARTITION_DRAM_TO_L2_QUEUE,
    IN_PARTITION_L2_FILL_QUEUE,
    IN_PARTITION_L2_MISS_QUEUE,
    IN_PARTITION_L2_TO_ICNT_QUEUE,
    IN_ICNT_TO_SHADER,
    IN_CLUSTER_TO_SHADER_QUEUE,
    IN_SHADER_LDST_RESPONSE_FIFO,
    IN_SHADER_L1T_ROB,
    IN_SHADER_FETCHED,
    DELETED,
}

pub mod access {
    use serde::{Deserialize, Serialize};
    use trace_model::ToBitString;

    #[derive(
        Debug,
        strum::EnumIter,
        strum::EnumCount,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
    )]
    pub enum Kind {
        GLOBAL_ACC_R,
        LOCAL_ACC_R,
        CONST_ACC_R,
        TEXTURE_ACC_R,
        GLOBAL_ACC_W,
        LOCAL_ACC_W,
        L1_WRBK_ACC,
        L2_WRBK_ACC,
        INST_ACC_R,
        L1_WR_ALLOC_R,
        L2_WR_ALLOC_R,
    }

    impl Kind {
        #[must_use]
        pub fn is_global(&self) -> bool {
            matches!(self, Kind::GLOBAL_ACC_R | Kind::GLOBAL_ACC_W)
        }

        #[must_use]
        pub fn is_local(&self) -> bool {
            matches!(self, Kind::LOCAL_ACC_R | Kind::LOCAL_ACC_W)
        }

        #[must_use]
        pub fn is_texture(&self) -> bool {
            *self == Kind::TEXTURE_ACC_R
        }

        #[must_use]
        pub fn is_const(&self) -> bool {
            *self == Kind::CONST_ACC_R
        }

        #[must_use]
        pub fn is_inst(&self) -> bool {
            *self == Kind::INST_ACC_R
        }

        /// Writebacks are fire-and-forget: they terminate at their sink and
        /// never produce an acknowledgement.
        #[must_use]
        pub fn is_writeback(&self) -> bool {
            matches!(self, Kind::L1_WRBK_ACC | Kind::L2_WRBK_ACC)
        }

        #[must_use]
        pub fn is_write(&self) -> bool {
            matches!(
                self,
                Kind::GLOBAL_ACC_W | Kind::LOCAL_ACC_W | Kind::L1_WRBK_ACC | Kind::L2_WRBK_ACC
            )
        }
    }

    impl From<Kind> for stats::cache::AccessKind {
        fn from(kind: Kind) -> Self {
            match kind {
                Kind::GLOBAL_ACC_R => Self::GLOBAL_ACC_R,
                Kind::LOCAL_ACC_R => Self::LOCAL_ACC_R,
                Kind::CONST_ACC_R => Self::CONST_ACC_R,
                Kind::TEXTURE_ACC_R => Self::TEXTURE_ACC_R,
                Kind::GLOBAL_ACC_W => Self::GLOBAL_ACC_W,
                Kind::LOCAL_ACC_W => Self::LOCAL_ACC_W,
                Kind::L1_WRBK_ACC => Self::L1_WRBK_ACC,
                Kind::L2_WRBK_ACC => Self::L2_WRBK_ACC,
                Kind::INST_ACC_R => Self::INST_ACC_R,
                Kind::L1_WR_ALLOC_R => Self::L1_WR_ALLOC_R,
                Kind::L2_WR_ALLOC_R => Self::L2_WR_ALLOC_R,
            }
        }
    }

    /// A memory access generated by the coalescer, a cache or the copy engine.
    #[derive(Clone, PartialEq, Eq, Hash)]
    pub struct MemAccess {
        /// Requested address.
        pub addr: super::address,
        /// Access kind.
        pub kind: Kind,
        /// Requested number of bytes.
        pub req_size_bytes: u32,
        pub is_write: bool,
        /// Active mask of the warp that issued this access.
        pub warp_active_mask: crate::warp::ActiveMask,
        pub byte_mask: super::ByteMask,
        pub sector_mask: super::SectorMask,
    }

    impl std::fmt::Debug for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_struct("MemAccess")
                .field("addr", &self.addr)
                .field("kind", &self.kind)
                .field("req_size_bytes", &self.req_size_bytes)
                .field("is_write", &self.is_write)
                .field("active_mask", &self.warp_active_mask.to_bit_string())
                .field("sector_mask", &self.sector_mask.to_bit_string())
                .finish()
        }
    }

    impl std::fmt::Display for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{:?}@{}", self.kind, self.addr)
        }
    }

    #[derive(Debug, Clone)]
    pub struct Builder {
        pub kind: Kind,
        pub addr: crate::address,
        pub req_size_bytes: u32,
        pub is_write: bool,
        pub warp_active_mask: crate::warp::ActiveMask,
        pub byte_mask: super::ByteMask,
        pub sector_mask: super::SectorMask,
    }

    impl Builder {
        #[must_use]
        pub fn build(self) -> MemAccess {
            assert_eq!(self.kind.is_write(), self.is_write);
            MemAccess {
                addr: self.addr,
                kind: self.kind,
                req_size_bytes: self.req_size_bytes,
                is_write: self.is_write,
                warp_active_mask: self.warp_active_mask,
                byte_mask: self.byte_mask,
                sector_mask: self.sector_mask,
            }
        }
    }

    impl MemAccess {
        #[must_use]
        pub fn control_size(&self) -> u32 {
            if self.is_write {
                super::WRITE_PACKET_SIZE + super::WRITE_MASK_SIZE
            } else {
                super::READ_PACKET_SIZE
            }
        }

        #[must_use]
        pub fn data_size(&self) -> u32 {
            self.req_size_bytes
        }

        #[must_use]
        pub fn size(&self) -> u32 {
            self.data_size() + self.control_size()
        }
    }
}

/// The packet traversing the memory system, one request or reply end-to-end.
#[derive(Clone, Debug)]
pub struct MemFetch {
    pub uid: u64,
    pub access: access::MemAccess,
    /// The issuing instruction, for writeback routing. Not set for
    /// writebacks, write-allocate reads and instruction fetches.
    pub instr: Option<WarpInstruction>,
    pub physical_addr: mcu::PhysicalAddress,
    pub partition_addr: address,
    pub kind: Kind,
    pub warp_id: usize,
    pub core_id: Option<usize>,
    pub cluster_id: Option<usize>,

    /// Cycle the fetch entered the interconnect towards memory.
    pub inject_cycle: Option<u64>,
    /// Cycle the reply was generated at the memory partition.
    pub reply_cycle: Option<u64>,
    /// Cycle the fetch was last received from the interconnect.
    pub icnt_receive_cycle: Option<u64>,

    pub status: Status,
    pub last_status_change: Option<u64>,

    /// Set when the L2 splits an oversize request into sector requests; points
    /// back at the original request.
    pub original_fetch: Option<Box<MemFetch>>,
    /// Under fetch-on-write, the read request carries the original write.
    pub original_write_fetch: Option<Box<MemFetch>>,
}

impl std::fmt::Display for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}({:?}@{})", self.kind, self.access.kind, self.addr())
    }
}

impl Eq for MemFetch {}

impl PartialEq for MemFetch {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl std::hash::Hash for MemFetch {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub uid: u64,
    pub access: access::MemAccess,
    pub instr: Option<WarpInstruction>,
    pub warp_id: usize,
    pub core_id: Option<usize>,
    pub cluster_id: Option<usize>,
    pub physical_addr: mcu::PhysicalAddress,
    pub partition_addr: address,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> MemFetch {
        let kind = if self.access.is_write {
            Kind::WRITE_REQUEST
        } else {
            Kind::READ_REQUEST
        };
        MemFetch {
            uid: self.uid,
            access: self.access,
            instr: self.instr,
            warp_id: self.warp_id,
            core_id: self.core_id,
            cluster_id: self.cluster_id,
            physical_addr: self.physical_addr,
            partition_addr: self.partition_addr,
            kind,
            status: Status::INITIALIZED,
            inject_cycle: None,
            reply_cycle: None,
            icnt_receive_cycle: None,
            last_status_change: None,
            original_fetch: None,
            original_write_fetch: None,
        }
    }
}

impl MemFetch {
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access.is_write
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.instr.as_ref().is_some_and(WarpInstruction::is_atomic)
    }

    #[must_use]
    pub fn is_texture(&self) -> bool {
        self.access.kind.is_texture()
    }

    #[must_use]
    pub fn addr(&self) -> address {
        self.access.addr
    }

    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.access.req_size_bytes
    }

    #[must_use]
    pub fn control_size(&self) -> u32 {
        self.access.control_size()
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.data_size() + self.control_size()
    }

    /// Size on the wire: writes and atomics carry their data, reads only the
    /// control header.
    #[must_use]
    pub fn packet_size(&self) -> u32 {
        if self.is_write() || self.is_atomic() {
            self.size()
        } else {
            self.control_size()
        }
    }

    #[must_use]
    pub fn sub_partition_id(&self) -> usize {
        self.physical_addr.sub_partition as usize
    }

    #[must_use]
    pub fn access_kind(&self) -> access::Kind {
        self.access.kind
    }

    pub fn set_status(&mut self, status: Status, time: u64) {
        self.status = status;
        self.last_status_change = Some(time);
    }

    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, Kind::READ_REPLY | Kind::WRITE_ACK)
    }

    /// Turn a request into its reply.
    ///
    /// READ_REQUEST becomes READ_REPLY, WRITE_REQUEST becomes WRITE_ACK.
    /// Calling this on a fetch that already is a reply is a no-op. Writeback
    /// accesses never become replies.
    pub fn set_reply(&mut self) {
        assert!(!self.access.kind.is_writeback());
        match self.kind {
            Kind::READ_REQUEST => {
                debug_assert!(!self.is_write());
                self.kind = Kind::READ_REPLY;
            }
            Kind::WRITE_REQUEST => {
                debug_assert!(self.is_write());
                self.kind = Kind::WRITE_ACK;
            }
            Kind::READ_REPLY | Kind::WRITE_ACK => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{access, Builder, Kind};
    use crate::warp::ActiveMask;

    fn read_fetch(addr: crate::address) -> super::MemFetch {
        let access = access::Builder {
            kind: access::Kind::GLOBAL_ACC_R,
            addr,
            req_size_bytes: 128,
            is_write: false,
            warp_active_mask: ActiveMask::ZERO,
            byte_mask: super::ByteMask::ZERO,
            sector_mask: super::SectorMask::ZERO,
        }
        .build();
        Builder {
            uid: 0,
            access,
            instr: None,
            warp_id: 0,
            core_id: None,
            cluster_id: None,
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: addr,
        }
        .build()
    }

    #[test]
    fn size_is_data_plus_control() {
        let fetch = read_fetch(0x100);
        assert_eq!(fetch.size(), 128 + super::READ_PACKET_SIZE);
        assert_eq!(fetch.packet_size(), super::READ_PACKET_SIZE);
    }

    #[test]
    fn set_reply_is_idempotent() {
        let mut fetch = read_fetch(0x100);
        assert_eq!(fetch.kind, Kind::READ_REQUEST);
        fetch.set_reply();
        assert_eq!(fetch.kind, Kind::READ_REPLY);
        fetch.set_reply();
        assert_eq!(fetch.kind, Kind::READ_REPLY);
    }
}
