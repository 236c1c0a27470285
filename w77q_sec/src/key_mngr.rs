// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use w77q_regs::NUM_SECTIONS;

use crate::cmd::Kid;
use crate::crypto::{HashBuf, Key};

/// Per-die key bookkeeping.
///
/// Section keys are borrowed from the caller and never copied. The session
/// key is the only key material owned here, and it is scrubbed whenever a
/// session ends.
pub struct KeyManager<'k> {
    restricted: [Option<&'k Key>; NUM_SECTIONS],
    full: [Option<&'k Key>; NUM_SECTIONS],
    session_key: Key,
    kid: Kid,
    /// Double buffered command contexts. One may be prepared while the
    /// other still belongs to a bus transaction in flight.
    ctx: [HashBuf; 2],
    cursor: usize,
}

impl Default for KeyManager<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'k> KeyManager<'k> {
    pub fn new() -> KeyManager<'k> {
        KeyManager {
            restricted: [None; NUM_SECTIONS],
            full: [None; NUM_SECTIONS],
            session_key: [0; 16],
            kid: Kid::INVALID,
            ctx: [HashBuf::default(); 2],
            cursor: 0,
        }
    }

    /// Store or clear a section key. Sections past the last one are
    /// ignored.
    pub fn set_key(&mut self, section: usize, key: Option<&'k Key>, full_access: bool) {
        let slots = if full_access {
            &mut self.full
        } else {
            &mut self.restricted
        };
        if let Some(slot) = slots.get_mut(section) {
            *slot = key;
        }
    }

    pub fn get_key(&self, section: usize, full_access: bool) -> Option<&'k Key> {
        let slots = if full_access { &self.full } else { &self.restricted };
        slots.get(section).copied().flatten()
    }

    /// Key registered for a section key id.
    pub fn key_for(&self, kid: Kid) -> Option<&'k Key> {
        if !kid.is_section_key() {
            return None;
        }
        self.get_key(usize::from(kid.section()), kid.is_full())
    }

    pub fn is_session_open(&self) -> bool {
        self.kid.is_valid()
    }

    pub fn kid(&self) -> Kid {
        self.kid
    }

    pub fn session_key(&self) -> &Key {
        &self.session_key
    }

    pub(crate) fn start_session(&mut self, kid: Kid, session_key: Key) {
        self.kid = kid;
        self.session_key = session_key;
    }

    /// Forget the open session and wipe its key.
    pub fn end_session(&mut self) {
        self.kid = Kid::INVALID;
        invalidate_key(&mut self.session_key);
        for c in self.ctx.iter_mut() {
            *c = HashBuf::default();
        }
    }

    /// Prepare the next command context, salted with the counter the
    /// command will consume, and make it current.
    pub(crate) fn next_context(&mut self, tc: u32) -> HashBuf {
        self.cursor ^= 1;
        self.ctx[self.cursor] = HashBuf::new(&self.session_key, tc);
        self.ctx[self.cursor]
    }

    /// The context most recently handed out, and the one before it.
    pub(crate) fn contexts(&self) -> (HashBuf, HashBuf) {
        (self.ctx[self.cursor], self.ctx[self.cursor ^ 1])
    }

    pub fn is_section_full_access(&self, section: u8) -> bool {
        self.kid == Kid::full(section)
    }

    pub fn is_section_restricted_access(&self, section: u8) -> bool {
        self.kid == Kid::restricted(section)
    }
}

impl std::fmt::Debug for KeyManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("kid", &self.kid)
            .field("restricted", &self.restricted.map(|k| k.is_some()))
            .field("full", &self.full.map(|k| k.is_some()))
            .finish()
    }
}

pub fn invalidate_key(key: &mut Key) {
    key.fill(0);
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}
