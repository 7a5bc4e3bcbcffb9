//! Interned atoms and the atom ↔ name cache.

use std::collections::HashMap;

use x11rb::protocol::xproto::Atom;

use super::transport::X11Transport;
use crate::error::Result;
use crate::exchange::DropAction;

/// Declares the fixed atom set and a constructor interning all of it
/// through a transport.
macro_rules! atoms {
    ($($name:ident),* $(,)?) => {
        /// Atoms the engine needs, interned once per connection.
        #[allow(non_snake_case)]
        #[derive(Debug, Clone, Copy)]
        pub struct Atoms {
            $(pub $name: Atom,)*
        }

        impl Atoms {
            pub fn intern(transport: &dyn X11Transport) -> Result<Self> {
                Ok(Self {
                    $($name: transport.intern_atom(stringify!($name))?,)*
                })
            }
        }
    };
}

atoms! {
    TARGETS,
    MULTIPLE,
    TIMESTAMP,
    INCR,
    ATOM,
    ATOM_PAIR,
    INTEGER,
    CLIPBOARD,
    PRIMARY,
    UTF8_STRING,
    STRING,
    TEXT,
    XdndAware,
    XdndEnter,
    XdndPosition,
    XdndStatus,
    XdndTypeList,
    XdndActionCopy,
    XdndActionMove,
    XdndActionAsk,
    XdndActionLink,
    XdndDrop,
    XdndLeave,
    XdndFinished,
    XdndSelection,
    XdndProxy,
}

impl Atoms {
    /// Targets that describe the selection rather than carry data.
    pub fn is_meta_target(&self, atom: Atom) -> bool {
        atom == self.TARGETS || atom == self.MULTIPLE || atom == self.TIMESTAMP
    }

    pub fn action_atom(&self, action: DropAction) -> Atom {
        match action {
            DropAction::None => x11rb::NONE,
            DropAction::Copy => self.XdndActionCopy,
            DropAction::Move => self.XdndActionMove,
            DropAction::Link => self.XdndActionLink,
            DropAction::Ask => self.XdndActionAsk,
        }
    }

    pub fn action_from_atom(&self, atom: Atom) -> DropAction {
        if atom == self.XdndActionCopy {
            DropAction::Copy
        } else if atom == self.XdndActionMove {
            DropAction::Move
        } else if atom == self.XdndActionLink {
            DropAction::Link
        } else if atom == self.XdndActionAsk {
            DropAction::Ask
        } else {
            DropAction::None
        }
    }
}

/// Names we have looked up or interned, both directions.
#[derive(Debug, Default)]
pub struct AtomNames {
    by_atom: HashMap<Atom, String>,
    by_name: HashMap<String, Atom>,
}

impl AtomNames {
    pub fn atom(&mut self, transport: &dyn X11Transport, name: &str) -> Result<Atom> {
        if let Some(&atom) = self.by_name.get(name) {
            return Ok(atom);
        }
        let atom = transport.intern_atom(name)?;
        self.remember(atom, name);
        Ok(atom)
    }

    pub fn name(&mut self, transport: &dyn X11Transport, atom: Atom) -> Result<String> {
        if let Some(name) = self.by_atom.get(&atom) {
            return Ok(name.clone());
        }
        let name = transport.atom_name(atom)?;
        self.remember(atom, &name);
        Ok(name)
    }

    /// Names for a list of atoms. `None` atoms and lookups that fail are
    /// skipped.
    pub fn names(&mut self, transport: &dyn X11Transport, atoms: &[Atom]) -> Vec<String> {
        atoms
            .iter()
            .filter(|&&a| a != x11rb::NONE)
            .filter_map(|&a| match self.name(transport, a) {
                Ok(name) => Some(name),
                Err(e) => {
                    tracing::debug!(atom = a, error = %e, "cannot name atom");
                    None
                }
            })
            .collect()
    }

    fn remember(&mut self, atom: Atom, name: &str) {
        self.by_atom.insert(atom, name.to_string());
        self.by_name.insert(name.to_string(), atom);
    }
}
