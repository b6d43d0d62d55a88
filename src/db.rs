// src/db.rs
//
// Bounded pool of long-lived PostgreSQL connections. All handles are opened
// at startup; `get` blocks when the pool is exhausted, which is the intended
// backpressure. A lease returns its handle on drop, on every exit path.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use postgres::{Client, NoTls};

use crate::error::ServerResult;

struct PoolInner<T> {
    free: Vec<T>,
    in_use: usize,
}

/// Counting-semaphore pool: the condvar stands in for the semaphore, its
/// effective value being the length of `free`.
pub struct Pool<T> {
    inner: Mutex<PoolInner<T>>,
    available: Condvar,
    max_conns: usize,
}

pub type DbPool = Pool<Client>;

impl<T> Pool<T> {
    pub fn from_items(items: Vec<T>) -> Self {
        let max_conns = items.len();
        Self {
            inner: Mutex::new(PoolInner {
                free: items,
                in_use: 0,
            }),
            available: Condvar::new(),
            max_conns,
        }
    }

    /// Lease a handle, blocking until one is free.
    pub fn get(&self) -> Lease<'_, T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.free.is_empty() {
            inner = self.available.wait(inner).unwrap();
        }
        let item = inner.free.pop().expect("free list non-empty");
        inner.in_use += 1;
        Lease {
            pool: self,
            item: Some(item),
        }
    }

    fn put_back(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.free.push(item);
        inner.in_use -= 1;
        self.available.notify_one();
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }

    pub fn max_conns(&self) -> usize {
        self.max_conns
    }
}

/// RAII lease on a pooled handle.
pub struct Lease<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> Deref for Lease<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("lease holds an item")
    }
}

impl<T> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("lease holds an item")
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put_back(item);
        }
    }
}

impl DbPool {
    /// Eagerly open `max_conns` connections against the DSN. Any failure here
    /// is fatal to startup.
    pub fn connect(url: &str, max_conns: usize) -> ServerResult<Self> {
        let mut clients = Vec::with_capacity(max_conns);
        for _ in 0..max_conns {
            clients.push(Client::connect(url, NoTls)?);
        }
        Ok(Pool::from_items(clients))
    }

    /// Preload the credentials map: `SELECT username, passwd FROM "user"`.
    pub fn load_users(&self) -> ServerResult<HashMap<String, String>> {
        let mut lease = self.get();
        let rows = lease.query(r#"SELECT username, passwd FROM "user""#, &[])?;
        let mut users = HashMap::with_capacity(rows.len());
        for row in rows {
            users.insert(row.get::<_, String>(0), row.get::<_, String>(1));
        }
        Ok(users)
    }
}

/// Seam between request dispatch and the database, so the state machine is
/// testable without a live server.
pub trait CredentialBackend: Send + Sync {
    fn insert_user(&self, username: &str, password: &str) -> ServerResult<()>;
}

impl CredentialBackend for DbPool {
    fn insert_user(&self, username: &str, password: &str) -> ServerResult<()> {
        // The statement text is interpolated, not parameterized.
        let sql = format!(
            r#"INSERT INTO "user"(username, passwd) VALUES('{}', '{}')"#,
            username, password
        );
        let mut lease = self.get();
        lease.batch_execute(&sql)?;
        Ok(())
    }
}
