//! Page-granular read caching.
//!
//! Each request is split into 4 KiB pages. The first request to touch a
//! page fetches it with its own page-aligned read and publishes the
//! bytes; overlapping requests await the in-flight fetch instead of
//! hitting the target again. The cache is invalidated whenever the
//! target is stopped or resumed, since its memory may have changed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use futures::future::{join_all, LocalBoxFuture};

use super::event::ManualEvent;
use super::Process;

/// Cache granularity.
pub const PAGE_SIZE: usize = 4096;

enum PageState {
    Pending,
    Ready(Rc<[u8]>),
    Failed(io::ErrorKind),
}

#[derive(Clone)]
struct Page {
    done: ManualEvent,
    state: Rc<RefCell<PageState>>,
}

impl Page {
    fn new() -> Page {
        Page {
            done: ManualEvent::new(),
            state: Rc::new(RefCell::new(PageState::Pending)),
        }
    }
}

/// Memoizing decorator over another [`Process`].
pub struct ProcessCache {
    inner: Box<dyn Process>,
    pages: RefCell<BTreeMap<usize, Page>>,
}

impl ProcessCache {
    pub fn new(inner: Box<dyn Process>) -> ProcessCache {
        ProcessCache {
            inner,
            pages: RefCell::new(BTreeMap::new()),
        }
    }

    fn clear(&self) {
        self.pages.borrow_mut().clear();
    }
}

impl Process for ProcessCache {
    fn id(&self) -> &[u8] {
        self.inner.id()
    }

    fn base_offset(&self) -> isize {
        self.inner.base_offset()
    }

    fn stop(&self) -> io::Result<()> {
        self.clear();
        self.inner.stop()
    }

    fn cont(&self) -> io::Result<()> {
        self.clear();
        self.inner.cont()
    }

    fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            if len == 0 {
                return Ok(Vec::new());
            }
            let first_page = address & !(PAGE_SIZE - 1);
            let last_page = (address + len - 1) & !(PAGE_SIZE - 1);

            // Claim missing pages while registering interest in the rest,
            // under one borrow so concurrent requests see a consistent map.
            let mut fetch = Vec::new();
            let mut pages = Vec::new();
            {
                let mut map = self.pages.borrow_mut();
                let mut base = first_page;
                loop {
                    let page = map
                        .entry(base)
                        .or_insert_with(|| {
                            let page = Page::new();
                            fetch.push((base, page.clone()));
                            page
                        })
                        .clone();
                    pages.push((base, page));
                    if base == last_page {
                        break;
                    }
                    base += PAGE_SIZE;
                }
            }

            join_all(fetch.into_iter().map(|(base, page)| async move {
                let result = self.inner.read(base, PAGE_SIZE).await;
                *page.state.borrow_mut() = match result {
                    Ok(bytes) => PageState::Ready(bytes.into()),
                    Err(err) => PageState::Failed(err.kind()),
                };
                page.done.set();
            }))
            .await;

            let mut out = vec![0u8; len];
            let mut error = None;
            for (base, page) in pages {
                if matches!(*page.state.borrow(), PageState::Pending) {
                    page.done.wait().await;
                }
                match &*page.state.borrow() {
                    PageState::Ready(bytes) => {
                        let start = address.max(base);
                        let end = (address + len).min(base + PAGE_SIZE);
                        out[start - address..end - address]
                            .copy_from_slice(&bytes[start - base..end - base]);
                    }
                    PageState::Failed(kind) => {
                        error.get_or_insert(*kind);
                    }
                    PageState::Pending => {
                        error.get_or_insert(io::ErrorKind::Other);
                    }
                }
            }
            match error {
                Some(kind) => Err(kind.into()),
                None => Ok(out),
            }
        })
    }

    fn sync(&self, task: LocalBoxFuture<'_, ()>) {
        self.inner.sync(task);
    }
}
