// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A pthread mutex with a selectable priority protocol.
//!
//! `std::sync::Mutex` cannot request priority inheritance. When real-time
//! workers contend with SCHED_OTHER workers on one lock, a preempted
//! low-priority holder would otherwise stall every FIFO/RR waiter.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::ops::DerefMut;

const PTHREAD_PRIO_NONE: libc::c_int = 0;
const PTHREAD_PRIO_INHERIT: libc::c_int = 1;

extern "C" {
    fn pthread_mutexattr_setprotocol(
        attr: *mut libc::pthread_mutexattr_t,
        protocol: libc::c_int,
    ) -> libc::c_int;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockProtocol {
    /// Plain futex mutex.
    None,
    /// Holder inherits the priority of the highest-priority waiter.
    Inherit,
}

impl LockProtocol {
    fn raw(self) -> libc::c_int {
        match self {
            LockProtocol::None => PTHREAD_PRIO_NONE,
            LockProtocol::Inherit => PTHREAD_PRIO_INHERIT,
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

pub struct PiMutex<T> {
    // Boxed so the pthread object never moves after init.
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for PiMutex<T> {}
unsafe impl<T: Send> Sync for PiMutex<T> {}

impl<T> PiMutex<T> {
    pub fn new(data: T, protocol: LockProtocol) -> io::Result<Self> {
        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));

        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) })?;
        let res = check(unsafe { pthread_mutexattr_setprotocol(attr.as_mut_ptr(), protocol.raw()) })
            .and_then(|_| {
                check(unsafe {
                    libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_NORMAL)
                })
            })
            .and_then(|_| check(unsafe { libc::pthread_mutex_init(raw.get(), attr.as_ptr()) }));
        unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
        res?;

        Ok(Self {
            raw,
            data: UnsafeCell::new(data),
        })
    }

    pub fn lock(&self) -> io::Result<PiMutexGuard<'_, T>> {
        check(unsafe { libc::pthread_mutex_lock(self.raw.get()) })?;
        Ok(PiMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    pub fn into_inner(self) -> T {
        // Tear down by hand so Drop does not destroy the mutex twice.
        let this = std::mem::ManuallyDrop::new(self);
        unsafe {
            libc::pthread_mutex_destroy(this.raw.get());
            let raw = std::ptr::read(&this.raw);
            drop(raw);
            std::ptr::read(&this.data).into_inner()
        }
    }
}

impl<T> Drop for PiMutex<T> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
    }
}

pub struct PiMutexGuard<'a, T> {
    mutex: &'a PiMutex<T>,
    // Must be unlocked by the locking thread.
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for PiMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for PiMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for PiMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
    }
}
