//! Storage manager intercept chain.
//!
//! Each backend owns an [`SmgrChain`]: an ordered list of links, each of
//! which may observe a call and must forward it through [`Next`]. The last
//! link performs the actual I/O.
//!
//! ```text
//! chain.readv(cx, ..)
//!   └─ StatsLink::readv ── next.readv ──> MemSmgr::readv (terminal)
//!          └─ account after the forwarded call returns
//! ```

mod aio;
mod mem;
mod stats_link;

use crate::backend::BackendContext;
use crate::seq::BlockNumber;
use crate::store::{ForkNumber, RelFileLocator};

pub use aio::{AioHandle, AioResult, AioSlot, AioSlots};
pub use mem::{MemSmgr, MemStorage};
pub use stats_link::StatsLink;

pub const BLOCK_SIZE: usize = 8192;

pub type Page = [u8; BLOCK_SIZE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmgrError {
    RelationNotFound {
        locator: RelFileLocator,
        fork: ForkNumber,
    },
    BeyondEof {
        locator: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        nblocks: BlockNumber,
    },
    /// The call reached the end of the chain without a terminal link.
    Unhandled(&'static str),
}

impl std::fmt::Display for SmgrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmgrError::RelationNotFound { locator, fork } => {
                write!(f, "relation {} fork {} does not exist", locator, fork.name())
            }
            SmgrError::BeyondEof {
                locator,
                fork,
                block,
                nblocks,
            } => write!(
                f,
                "block {} of relation {} fork {} is beyond end of file ({} blocks)",
                block,
                locator,
                fork.name(),
                nblocks
            ),
            SmgrError::Unhandled(op) => write!(f, "no storage manager handled {}", op),
        }
    }
}

impl std::error::Error for SmgrError {}

pub type SmgrResult<T> = Result<T, SmgrError>;

/// An opened relation as seen by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmgrRelation {
    pub locator: RelFileLocator,
    /// Backend-private temporary relation.
    pub is_temp: bool,
}

impl SmgrRelation {
    pub fn new(locator: RelFileLocator) -> Self {
        Self {
            locator,
            is_temp: false,
        }
    }

    pub fn temp(locator: RelFileLocator) -> Self {
        Self {
            locator,
            is_temp: true,
        }
    }
}

/// One link of the chain. Every method defaults to plain forwarding.
pub trait SmgrLink: Send {
    fn name(&self) -> &'static str;

    fn open(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
    ) -> SmgrResult<()> {
        next.open(cx, rel)
    }

    /// `old` is the relation's previous locator when storage is being
    /// replaced, or a locator with relation number 0.
    fn create(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        old: RelFileLocator,
        rel: &SmgrRelation,
        fork: ForkNumber,
        is_redo: bool,
    ) -> SmgrResult<()> {
        next.create(cx, old, rel, fork, is_redo)
    }

    fn readv(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &mut [Page],
    ) -> SmgrResult<()> {
        next.readv(cx, rel, fork, block, buffers)
    }

    fn start_readv(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        handle: &AioHandle,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> SmgrResult<()> {
        next.start_readv(cx, handle, rel, fork, block)
    }

    /// Completion callback for reads started with `start_readv`. Runs where
    /// allocation and catalog access are not allowed. Must return `prior`
    /// or a worse result.
    fn complete_readv(
        &mut self,
        _cx: &mut BackendContext,
        _handle: &AioHandle,
        prior: AioResult,
    ) -> AioResult {
        prior
    }

    #[allow(clippy::too_many_arguments)]
    fn writev(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &[Page],
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        next.writev(cx, rel, fork, block, buffers, skip_fsync)
    }

    #[allow(clippy::too_many_arguments)]
    fn extend(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        next.extend(cx, rel, fork, block, buffer, skip_fsync)
    }

    #[allow(clippy::too_many_arguments)]
    fn zero_extend(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        nblocks: BlockNumber,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        next.zero_extend(cx, rel, fork, block, nblocks, skip_fsync)
    }

    fn truncate(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> SmgrResult<()> {
        next.truncate(cx, rel, fork, old_nblocks, nblocks)
    }

    fn immedsync(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> SmgrResult<()> {
        next.immedsync(cx, rel, fork)
    }
}

/// The links after the current one.
pub struct Next<'a> {
    links: &'a mut [Box<dyn SmgrLink>],
}

impl<'a> Next<'a> {
    fn split(self) -> Option<(&'a mut Box<dyn SmgrLink>, Next<'a>)> {
        let links = self.links;
        let (first, rest) = links.split_first_mut()?;
        Some((first, Next { links: rest }))
    }

    pub fn open(self, cx: &mut BackendContext, rel: &SmgrRelation) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.open(cx, next, rel),
            None => Err(SmgrError::Unhandled("open")),
        }
    }

    pub fn create(
        self,
        cx: &mut BackendContext,
        old: RelFileLocator,
        rel: &SmgrRelation,
        fork: ForkNumber,
        is_redo: bool,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.create(cx, next, old, rel, fork, is_redo),
            None => Err(SmgrError::Unhandled("create")),
        }
    }

    pub fn readv(
        self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &mut [Page],
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.readv(cx, next, rel, fork, block, buffers),
            None => Err(SmgrError::Unhandled("readv")),
        }
    }

    pub fn start_readv(
        self,
        cx: &mut BackendContext,
        handle: &AioHandle,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.start_readv(cx, next, handle, rel, fork, block),
            None => Err(SmgrError::Unhandled("start_readv")),
        }
    }

    pub fn writev(
        self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &[Page],
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.writev(cx, next, rel, fork, block, buffers, skip_fsync),
            None => Err(SmgrError::Unhandled("writev")),
        }
    }

    pub fn extend(
        self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.extend(cx, next, rel, fork, block, buffer, skip_fsync),
            None => Err(SmgrError::Unhandled("extend")),
        }
    }

    pub fn zero_extend(
        self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        nblocks: BlockNumber,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => {
                link.zero_extend(cx, next, rel, fork, block, nblocks, skip_fsync)
            }
            None => Err(SmgrError::Unhandled("zero_extend")),
        }
    }

    pub fn truncate(
        self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.truncate(cx, next, rel, fork, old_nblocks, nblocks),
            None => Err(SmgrError::Unhandled("truncate")),
        }
    }

    pub fn immedsync(
        self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> SmgrResult<()> {
        match self.split() {
            Some((link, next)) => link.immedsync(cx, next, rel, fork),
            None => Err(SmgrError::Unhandled("immedsync")),
        }
    }
}

/// Ordered list of links, outermost first.
#[derive(Default)]
pub struct SmgrChain {
    links: Vec<Box<dyn SmgrLink>>,
}

impl SmgrChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, link: impl SmgrLink + 'static) -> Self {
        self.links.push(Box::new(link));
        self
    }

    pub fn link_names(&self) -> Vec<&'static str> {
        self.links.iter().map(|l| l.name()).collect()
    }

    fn head(&mut self) -> Next<'_> {
        Next {
            links: &mut self.links,
        }
    }

    pub fn open(&mut self, cx: &mut BackendContext, rel: &SmgrRelation) -> SmgrResult<()> {
        self.head().open(cx, rel)
    }

    pub fn create(
        &mut self,
        cx: &mut BackendContext,
        old: RelFileLocator,
        rel: &SmgrRelation,
        fork: ForkNumber,
        is_redo: bool,
    ) -> SmgrResult<()> {
        self.head().create(cx, old, rel, fork, is_redo)
    }

    pub fn readv(
        &mut self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &mut [Page],
    ) -> SmgrResult<()> {
        self.head().readv(cx, rel, fork, block, buffers)
    }

    pub fn start_readv(
        &mut self,
        cx: &mut BackendContext,
        handle: &AioHandle,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> SmgrResult<()> {
        self.head().start_readv(cx, handle, rel, fork, block)
    }

    /// Runs every link's completion callback in chain order.
    pub fn complete_readv(
        &mut self,
        cx: &mut BackendContext,
        handle: &AioHandle,
        result: AioResult,
    ) -> AioResult {
        self.links
            .iter_mut()
            .fold(result, |r, link| link.complete_readv(cx, handle, r))
    }

    pub fn writev(
        &mut self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &[Page],
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.head().writev(cx, rel, fork, block, buffers, skip_fsync)
    }

    pub fn extend(
        &mut self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.head().extend(cx, rel, fork, block, buffer, skip_fsync)
    }

    pub fn zero_extend(
        &mut self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        nblocks: BlockNumber,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.head()
            .zero_extend(cx, rel, fork, block, nblocks, skip_fsync)
    }

    pub fn truncate(
        &mut self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> SmgrResult<()> {
        self.head().truncate(cx, rel, fork, old_nblocks, nblocks)
    }

    pub fn immedsync(
        &mut self,
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> SmgrResult<()> {
        self.head().immedsync(cx, rel, fork)
    }
}
