//! Jobs accepted by the background queue.

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::SystemTime;

/// Job class; each class has its own worker and FIFO queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobClass {
    CloseFile,
    Fsync,
    LazyFree,
}

impl JobClass {
    pub const ALL: [JobClass; 3] = [JobClass::CloseFile, JobClass::Fsync, JobClass::LazyFree];

    pub(crate) fn index(self) -> usize {
        match self {
            JobClass::CloseFile => 0,
            JobClass::Fsync => 1,
            JobClass::LazyFree => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JobClass::CloseFile => "close",
            JobClass::Fsync => "fsync",
            JobClass::LazyFree => "lazyfree",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Anything that can be released off the reactor thread.
pub type Payload = Box<dyn Any + Send>;

pub enum LazyFree {
    /// A single value.
    Object(Payload),
    /// Two containers released together, e.g. a keyspace and its expiry table.
    Pair(Payload, Payload),
}

pub enum JobKind {
    /// Close a descriptor (the close may block on the last reference to a
    /// file being unlinked).
    CloseFile(OwnedFd),
    /// Flush file data to stable storage.
    Fsync(Arc<File>),
    LazyFree(LazyFree),
}

pub struct Job {
    pub created: SystemTime,
    pub kind: JobKind,
}

impl Job {
    fn new(kind: JobKind) -> Self {
        Self {
            created: SystemTime::now(),
            kind,
        }
    }

    pub fn close(fd: impl Into<OwnedFd>) -> Self {
        Self::new(JobKind::CloseFile(fd.into()))
    }

    pub fn fsync(file: Arc<File>) -> Self {
        Self::new(JobKind::Fsync(file))
    }

    pub fn lazy_free<T: Send + 'static>(object: T) -> Self {
        Self::new(JobKind::LazyFree(LazyFree::Object(Box::new(object))))
    }

    pub fn lazy_free_pair<A, B>(first: A, second: B) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
    {
        Self::new(JobKind::LazyFree(LazyFree::Pair(
            Box::new(first),
            Box::new(second),
        )))
    }

    pub fn class(&self) -> JobClass {
        match self.kind {
            JobKind::CloseFile(_) => JobClass::CloseFile,
            JobKind::Fsync(_) => JobClass::Fsync,
            JobKind::LazyFree(_) => JobClass::LazyFree,
        }
    }

    /// Execute the job on the calling thread.
    pub(crate) fn run(self) -> io::Result<()> {
        match self.kind {
            JobKind::CloseFile(fd) => {
                drop(fd);
                Ok(())
            }
            JobKind::Fsync(file) => file.sync_data(),
            JobKind::LazyFree(LazyFree::Object(object)) => {
                drop(object);
                Ok(())
            }
            JobKind::LazyFree(LazyFree::Pair(first, second)) => {
                drop(first);
                drop(second);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("class", &self.class())
            .field("created", &self.created)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_follows_payload() {
        assert_eq!(Job::lazy_free(vec![1u8, 2, 3]).class(), JobClass::LazyFree);
        assert_eq!(Job::lazy_free_pair(1u32, "x").class(), JobClass::LazyFree);
        let file = tempfile::tempfile().unwrap();
        assert_eq!(Job::fsync(Arc::new(file)).class(), JobClass::Fsync);
        let file = tempfile::tempfile().unwrap();
        assert_eq!(Job::close(file).class(), JobClass::CloseFile);
    }

    #[test]
    fn test_class_indices_are_distinct() {
        let mut seen: Vec<usize> = JobClass::ALL.iter().map(|c| c.index()).collect();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_run_fsync_on_tempfile() {
        use std::io::Write;
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"durable").unwrap();
        assert!(Job::fsync(Arc::new(file)).run().is_ok());
    }
}
