// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware wire formats
//!
//! Frame descriptors, frame list entries, source/destination descriptors and
//! scatter-gather entries exactly as the queue DMA block reads them. Each
//! structure is a `#[repr(C)]` run of little-endian 32-bit words; fields are
//! reached through accessors so nothing depends on compiler bitfield layout.
//!
//! ```text
//!  short FD                      long / SG FD
//! ┌───────────────────────┐     ┌───────────────────────┐
//! │ w0 src[31:0]          │     │ w0 list[31:0]         │──┐
//! │ w1 src[48:32]         │     │ w1 list[48:32]        │  │
//! │ w2 length             │     │ w2 total length       │  │
//! │ w3 ctrl (fmt=single)  │     │ w3 ctrl (fmt=list)    │  │
//! │ w4 dst[31:0]          │     │ w4 frc                │  │
//! │ w5 dst[48:32]         │     │ w5 reserved           │  │
//! │ w6 attribute | SER    │     │ w6 attribute | SER    │  │
//! │ w7 vchan              │     │ w7 vchan | slot       │  │
//! └───────────────────────┘     └───────────────────────┘  │
//!                                ┌─────────────────────────┘
//!                                ▼
//!                  [SDD FLE][SRC FLE][DST FLE][SRC SDD][DST SDD]
//!                               │         │
//!                  long: buffer │         │ buffer
//!                  SG:   SG table         SG table
//! ```

use core::fmt;

/// Bit position of the format tag inside the 16-bit attribute
pub const FD_FORMAT_SHIFT: u32 = 13;
/// Largest caller index the attribute can carry
pub const CONTEXT_INDEX_MASK: u16 = (1 << FD_FORMAT_SHIFT) - 1;
/// Number of distinct caller indices
pub const INDEX_SPACE: usize = 1 << FD_FORMAT_SHIFT;

/// Width of a hardware I/O virtual address
pub const IOVA_BITS: u32 = 49;
pub const MAX_IOVA: u64 = (1 << IOVA_BITS) - 1;
const ADDR_HI_MASK: u32 = (1 << (IOVA_BITS - 32)) - 1;

/// Frame descriptor format tag, top three bits of the attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FdFormat {
    /// Inline source and destination, no frame list
    Short = 1,
    /// Frame list describing one buffer pair
    Long = 2,
    /// Frame list whose buffers are scatter-gather tables
    Sg = 3,
}

impl FdFormat {
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FdFormat::Short),
            2 => Some(FdFormat::Long),
            3 => Some(FdFormat::Sg),
            _ => None,
        }
    }

    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Pack a format tag and caller index into an attribute
pub const fn encode_attribute(format: FdFormat, index: u16) -> u16 {
    ((format as u16) << FD_FORMAT_SHIFT) | (index & CONTEXT_INDEX_MASK)
}

pub const fn attribute_tag(attribute: u16) -> u8 {
    (attribute >> FD_FORMAT_SHIFT) as u8
}

pub const fn attribute_index(attribute: u16) -> u16 {
    attribute & CONTEXT_INDEX_MASK
}

/// Contents of the 2-bit `fmt` control field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferFormat {
    Single = 0,
    FrameList = 1,
    ScatterGather = 2,
}

impl BufferFormat {
    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(BufferFormat::Single),
            1 => Some(BufferFormat::FrameList),
            2 => Some(BufferFormat::ScatterGather),
            _ => None,
        }
    }
}

/// Control word layout shared by FD word 3, FLEs and SG entries
mod ctrl {
    pub const BPID_MASK: u32 = 0x3FFF;
    pub const IVP: u32 = 1 << 14;
    pub const BMT: u32 = 1 << 15;
    pub const OFFSET_SHIFT: u32 = 16;
    pub const OFFSET_MASK: u32 = 0xFFF;
    pub const FMT_SHIFT: u32 = 28;
    pub const FMT_MASK: u32 = 0x3;
    pub const SL: u32 = 1 << 30;
    pub const FINAL: u32 = 1 << 31;
}

#[inline]
fn split_addr(iova: u64) -> (u32, u32) {
    (iova as u32, ((iova >> 32) as u32) & ADDR_HI_MASK)
}

#[inline]
fn join_addr(lo: u32, hi: u32) -> u64 {
    (u64::from(hi & ADDR_HI_MASK) << 32) | u64::from(lo)
}

#[inline]
fn set_flag(word: &mut u32, flag: u32, on: bool) {
    if on {
        *word |= flag;
    } else {
        *word &= !flag;
    }
}

#[inline]
fn with_format(word: u32, format: BufferFormat) -> u32 {
    (word & !(ctrl::FMT_MASK << ctrl::FMT_SHIFT)) | ((format as u32) << ctrl::FMT_SHIFT)
}

#[inline]
fn format_of(word: u32) -> Option<BufferFormat> {
    BufferFormat::from_bits((word >> ctrl::FMT_SHIFT) & ctrl::FMT_MASK)
}

/// Routing word of a frame descriptor: owning vchan and context slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowContext {
    pub vchan: u16,
    pub slot: u16,
}

impl FlowContext {
    pub const fn new(vchan: u16, slot: u16) -> Self {
        Self { vchan, slot }
    }

    pub const fn to_word(self) -> u32 {
        ((self.vchan as u32) << 16) | self.slot as u32
    }

    pub const fn from_word(word: u32) -> Self {
        Self {
            vchan: (word >> 16) as u16,
            slot: word as u16,
        }
    }
}

/// Status enqueue request: hardware returns the FD on the receive path
const FD_SER: u32 = 1 << 16;
const FD_ATTR_MASK: u32 = 0xFFFF;

/// 32-byte frame descriptor
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct FrameDesc {
    words: [u32; 8],
}

impl FrameDesc {
    const ADDR_LO: usize = 0;
    const ADDR_HI: usize = 1;
    const LEN: usize = 2;
    const CTRL: usize = 3;
    const DST_LO: usize = 4;
    const DST_HI: usize = 5;
    const ATTR: usize = 6;
    const FLC: usize = 7;

    /// Inline copy descriptor
    pub fn short(src: u64, dst: u64, len: u32, index: u16, status: bool, vchan: u16) -> Self {
        let mut fd = Self::default();
        let (src_lo, src_hi) = split_addr(src);
        let (dst_lo, dst_hi) = split_addr(dst);
        fd.words[Self::ADDR_LO] = src_lo;
        fd.words[Self::ADDR_HI] = src_hi;
        fd.words[Self::LEN] = len;
        fd.words[Self::CTRL] = with_format(0, BufferFormat::Single);
        fd.words[Self::DST_LO] = dst_lo;
        fd.words[Self::DST_HI] = dst_hi;
        fd.set_attribute(encode_attribute(FdFormat::Short, index), status);
        fd.words[Self::FLC] = FlowContext::new(vchan, 0).to_word();
        fd
    }

    /// Descriptor pointing at a context block's frame list
    pub fn compound(
        format: FdFormat,
        list_iova: u64,
        len: u32,
        index: u16,
        status: bool,
        flow: FlowContext,
    ) -> Self {
        debug_assert!(format != FdFormat::Short);
        let mut fd = Self::default();
        let (lo, hi) = split_addr(list_iova);
        fd.words[Self::ADDR_LO] = lo;
        fd.words[Self::ADDR_HI] = hi;
        fd.words[Self::LEN] = len;
        fd.words[Self::CTRL] = with_format(0, BufferFormat::FrameList);
        fd.set_attribute(encode_attribute(format, index), status);
        fd.words[Self::FLC] = flow.to_word();
        fd
    }

    pub const fn from_words(words: [u32; 8]) -> Self {
        Self { words }
    }

    pub const fn words(&self) -> &[u32; 8] {
        &self.words
    }

    /// Overwrite the attribute, keeping the rest of the descriptor
    pub fn set_attribute(&mut self, attribute: u16, status: bool) {
        let mut word = u32::from(attribute);
        if status {
            word |= FD_SER;
        }
        self.words[Self::ATTR] = word;
    }

    pub fn attribute(&self) -> u16 {
        (self.words[Self::ATTR] & FD_ATTR_MASK) as u16
    }

    pub fn format_tag(&self) -> u8 {
        attribute_tag(self.attribute())
    }

    pub fn format(&self) -> Option<FdFormat> {
        FdFormat::from_tag(self.format_tag())
    }

    pub fn caller_index(&self) -> u16 {
        attribute_index(self.attribute())
    }

    /// Whether hardware posts this descriptor back once done
    pub fn status_requested(&self) -> bool {
        self.words[Self::ATTR] & FD_SER != 0
    }

    pub fn flow_context(&self) -> FlowContext {
        FlowContext::from_word(self.words[Self::FLC])
    }

    /// Source address (short) or frame list address (long, SG)
    pub fn addr(&self) -> u64 {
        join_addr(self.words[Self::ADDR_LO], self.words[Self::ADDR_HI])
    }

    /// Destination address of a short descriptor
    pub fn dst_addr(&self) -> u64 {
        join_addr(self.words[Self::DST_LO], self.words[Self::DST_HI])
    }

    pub fn len(&self) -> u32 {
        self.words[Self::LEN]
    }

    pub fn buffer_format(&self) -> Option<BufferFormat> {
        format_of(self.words[Self::CTRL])
    }
}

impl fmt::Debug for FrameDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flow = self.flow_context();
        match self.format() {
            Some(FdFormat::Short) => write!(
                f,
                "FD short src={:#x} dst={:#x} len={} idx={} ser={} vchan={}",
                self.addr(),
                self.dst_addr(),
                self.len(),
                self.caller_index(),
                self.status_requested(),
                flow.vchan
            ),
            Some(format) => write!(
                f,
                "FD {:?} list={:#x} len={} idx={} ser={} vchan={} slot={}",
                format,
                self.addr(),
                self.len(),
                self.caller_index(),
                self.status_requested(),
                flow.vchan,
                flow.slot
            ),
            None => write!(f, "FD raw {:08x?}", self.words),
        }
    }
}

/// 32-byte frame list entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Fle {
    addr_lo: u32,
    addr_hi: u32,
    length: u32,
    ctrl: u32,
    frc: u32,
    _reserved: [u32; 3],
}

impl Fle {
    pub fn set_addr(&mut self, iova: u64) {
        let (lo, hi) = split_addr(iova);
        self.addr_lo = lo;
        self.addr_hi = hi;
    }

    pub fn addr(&self) -> u64 {
        join_addr(self.addr_lo, self.addr_hi)
    }

    pub fn set_len(&mut self, len: u32) {
        self.length = len;
    }

    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn set_format(&mut self, format: BufferFormat) {
        self.ctrl = with_format(self.ctrl, format);
    }

    pub fn format(&self) -> Option<BufferFormat> {
        format_of(self.ctrl)
    }

    /// Marks the last entry of the frame list
    pub fn set_final(&mut self, last: bool) {
        set_flag(&mut self.ctrl, ctrl::FINAL, last);
    }

    pub fn is_final(&self) -> bool {
        self.ctrl & ctrl::FINAL != 0
    }

    pub fn set_bmt(&mut self, on: bool) {
        set_flag(&mut self.ctrl, ctrl::BMT, on);
    }

    pub fn bmt(&self) -> bool {
        self.ctrl & ctrl::BMT != 0
    }
}

/// Position of each FLE in a context block's frame list
pub const FLE_SDD: usize = 0;
pub const FLE_SRC: usize = 1;
pub const FLE_DST: usize = 2;
pub const FLE_COUNT: usize = 3;

pub const SDD_SRC: usize = 0;
pub const SDD_DST: usize = 1;
pub const SDD_COUNT: usize = 2;

/// SDD command word fields
mod sdd {
    pub const PORTID_MASK: u32 = 0xF;
    pub const RBP: u32 = 1 << 18;
    pub const STRIDE_EN: u32 = 1 << 19;
    pub const QOS_SHIFT: u32 = 24;
    pub const TYPE_SHIFT: u32 = 28;
    pub const TYPE_MASK: u32 = 0xF;

    pub const VFID_MASK: u32 = 0x3F;
    pub const PFID: u32 = 1 << 8;
    pub const VFA: u32 = 1 << 22;
}

/// Transaction type for route-by-port endpoints
pub const RBP_MEM_RW: u32 = 0x0;

/// Hardware generation, picks the memory coherency transaction codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// LS2088A class parts
    Ls2088,
    /// LX2160A class parts
    Lx2160,
}

impl Generation {
    /// Coherent read, do not allocate into cache
    pub const fn read_coherency(self) -> u32 {
        match self {
            Generation::Ls2088 => 0xb,
            Generation::Lx2160 => 0x7,
        }
    }

    /// Coherent write, allocate into cache
    pub const fn write_coherency(self) -> u32 {
        match self {
            Generation::Ls2088 => 0x6,
            Generation::Lx2160 => 0xb,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Generation::Ls2088 => "ls2088",
            Generation::Lx2160 => "lx2160",
        }
    }
}

/// External port addressing for a route-by-port endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePort {
    pub port_id: u8,
    pub pf_id: u8,
    pub vf_id: Option<u8>,
}

/// 16-byte source/destination descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Sdd {
    _reserved: u32,
    stride: u32,
    rbpcmd: u32,
    cmd: u32,
}

impl Sdd {
    /// Plain memory source
    pub const fn memory_read(generation: Generation) -> Self {
        Self::with_cmd(generation.read_coherency() << sdd::TYPE_SHIFT, 0)
    }

    /// Plain memory destination
    pub const fn memory_write(generation: Generation) -> Self {
        Self::with_cmd(generation.write_coherency() << sdd::TYPE_SHIFT, 0)
    }

    /// Route-by-port endpoint; identical layout for either direction
    pub fn port(port: RoutePort) -> Self {
        let cmd = (u32::from(port.port_id) & sdd::PORTID_MASK)
            | sdd::RBP
            | (RBP_MEM_RW << sdd::TYPE_SHIFT);
        let mut rbpcmd = 0;
        if port.pf_id != 0 {
            rbpcmd |= sdd::PFID;
        }
        if let Some(vf_id) = port.vf_id {
            rbpcmd |= (u32::from(vf_id) & sdd::VFID_MASK) | sdd::VFA;
        }
        Self::with_cmd(cmd, rbpcmd)
    }

    const fn with_cmd(cmd: u32, rbpcmd: u32) -> Self {
        Self {
            _reserved: 0,
            stride: 0,
            rbpcmd,
            cmd,
        }
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    pub fn rbpcmd(&self) -> u32 {
        self.rbpcmd
    }

    pub fn route_by_port(&self) -> bool {
        self.cmd & sdd::RBP != 0
    }

    pub fn port_id(&self) -> u8 {
        (self.cmd & sdd::PORTID_MASK) as u8
    }

    pub fn transaction_type(&self) -> u32 {
        (self.cmd >> sdd::TYPE_SHIFT) & sdd::TYPE_MASK
    }

    pub fn stride_enabled(&self) -> bool {
        self.cmd & sdd::STRIDE_EN != 0
    }

    pub fn qos(&self) -> u32 {
        (self.cmd >> sdd::QOS_SHIFT) & 0x7
    }

    pub fn vf_id(&self) -> Option<u8> {
        (self.rbpcmd & sdd::VFA != 0).then(|| (self.rbpcmd & sdd::VFID_MASK) as u8)
    }

    pub fn pf_id(&self) -> u8 {
        u8::from(self.rbpcmd & sdd::PFID != 0)
    }
}

/// 16-byte scatter-gather table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SgEntry {
    addr_lo: u32,
    addr_hi: u32,
    data_len: u32,
    ctrl: u32,
}

impl SgEntry {
    /// Rewrite the entry as a single data buffer with a long length field
    pub fn set(&mut self, iova: u64, len: u32, last: bool) {
        let (lo, hi) = split_addr(iova);
        self.addr_lo = lo;
        self.addr_hi = hi;
        self.data_len = len;
        let mut word = with_format(self.ctrl & !ctrl::SL, BufferFormat::Single);
        set_flag(&mut word, ctrl::FINAL, last);
        self.ctrl = word;
    }

    pub fn addr(&self) -> u64 {
        join_addr(self.addr_lo, self.addr_hi)
    }

    pub fn len(&self) -> u32 {
        self.data_len
    }

    pub fn is_final(&self) -> bool {
        self.ctrl & ctrl::FINAL != 0
    }

    pub fn set_bmt(&mut self, on: bool) {
        set_flag(&mut self.ctrl, ctrl::BMT, on);
    }

    pub fn bmt(&self) -> bool {
        self.ctrl & ctrl::BMT != 0
    }

    pub fn format(&self) -> Option<BufferFormat> {
        format_of(self.ctrl)
    }

    pub fn short_length(&self) -> bool {
        self.ctrl & ctrl::SL != 0
    }

    pub fn buffer_pool(&self) -> u16 {
        (self.ctrl & ctrl::BPID_MASK) as u16
    }

    pub fn offset(&self) -> u16 {
        ((self.ctrl >> ctrl::OFFSET_SHIFT) & ctrl::OFFSET_MASK) as u16
    }

    pub fn invalid_pool(&self) -> bool {
        self.ctrl & ctrl::IVP != 0
    }
}

/// Frame list plus routing descriptors, the head of every context block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FleSdd {
    pub fle: [Fle; FLE_COUNT],
    pub sdd: [Sdd; SDD_COUNT],
}
