//! The X11 request surface the engine uses, and its `RustConnection`
//! implementation.
//!
//! Everything the selection and Xdnd state machines send goes through
//! [`X11Transport`]; events come back as [`X11Event`]. Tests drive the
//! state machines against a recording implementation instead of a
//! display.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use x11rb::connection::Connection;
use x11rb::errors::{ConnectionError, ReplyError};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    self, Atom, AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt as _,
    CreateWindowAux, EventMask, PropMode, Property, SELECTION_NOTIFY_EVENT, SelectionNotifyEvent,
    Timestamp, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;

use crate::error::{ExchangeError, Result};

/// Events the engine reacts to, translated from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X11Event {
    /// A peer wants one of our selections converted.
    SelectionRequest {
        time: Timestamp,
        owner: Window,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    },
    /// Answer to a conversion we asked for. `property == NONE` is a refusal.
    SelectionNotify {
        time: Timestamp,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    },
    /// We lost ownership.
    SelectionClear {
        time: Timestamp,
        owner: Window,
        selection: Atom,
    },
    PropertyNotify {
        window: Window,
        atom: Atom,
        time: Timestamp,
        deleted: bool,
    },
    ClientMessage {
        window: Window,
        type_: Atom,
        data: [u32; 5],
    },
}

impl X11Event {
    /// Translate a wire event. Events the engine has no use for map to
    /// `None`.
    pub fn from_wire(event: Event) -> Option<Self> {
        match event {
            Event::SelectionRequest(e) => Some(X11Event::SelectionRequest {
                time: e.time,
                owner: e.owner,
                requestor: e.requestor,
                selection: e.selection,
                target: e.target,
                property: e.property,
            }),
            Event::SelectionNotify(e) => Some(X11Event::SelectionNotify {
                time: e.time,
                requestor: e.requestor,
                selection: e.selection,
                target: e.target,
                property: e.property,
            }),
            Event::SelectionClear(e) => Some(X11Event::SelectionClear {
                time: e.time,
                owner: e.owner,
                selection: e.selection,
            }),
            Event::PropertyNotify(e) => Some(X11Event::PropertyNotify {
                window: e.window,
                atom: e.atom,
                time: e.time,
                deleted: e.state == Property::DELETE,
            }),
            Event::ClientMessage(e) if e.format == 32 => Some(X11Event::ClientMessage {
                window: e.window,
                type_: e.type_,
                data: e.data.as_data32(),
            }),
            Event::Error(e) => {
                tracing::debug!(error = ?e, "X11 error event");
                None
            }
            _ => None,
        }
    }
}

/// A property as read back from a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

impl PropertyValue {
    /// Interpret a format-32 property as a list of atoms (or any u32s).
    pub fn atoms(&self) -> Vec<u32> {
        if self.format != 32 {
            return Vec::new();
        }
        self.data
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Pack u32 values the way format-32 properties carry them.
pub fn pack32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Requests the selection and Xdnd machinery issues.
///
/// "Our window" is the hidden window created per connection; it owns
/// our selections and receives converted data.
pub trait X11Transport {
    fn window(&self) -> Window;

    fn intern_atom(&self, name: &str) -> Result<Atom>;

    fn atom_name(&self, atom: Atom) -> Result<String>;

    /// Make our window the owner of `selection`.
    fn set_selection_owner(&self, selection: Atom, time: Timestamp) -> Result<()>;

    /// Give up `selection` if we hold it.
    fn clear_selection_owner(&self, selection: Atom, time: Timestamp) -> Result<()>;

    fn selection_owner(&self, selection: Atom) -> Result<Window>;

    /// Ask the owner of `selection` to convert it into `property` on our
    /// window.
    fn convert_selection(
        &self,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()>;

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<()>;

    /// Read a property. `Ok(None)` when it does not exist.
    fn get_property(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<PropertyValue>>;

    fn delete_property(&self, window: Window, property: Atom) -> Result<()>;

    /// Answer a conversion request. `property == NONE` refuses it.
    fn send_selection_notify(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()>;

    /// Send a format-32 client message to `destination`, addressed to
    /// `window` (they differ when the target uses an XdndProxy).
    fn send_client_message(
        &self,
        destination: Window,
        window: Window,
        type_: Atom,
        data: [u32; 5],
    ) -> Result<()>;

    /// Subscribe to property changes on a foreign window (INCR sends).
    fn watch_properties(&self, window: Window) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

fn conn_err(what: &str, e: ConnectionError) -> ExchangeError {
    ExchangeError::Connection(format!("{what}: {e}"))
}

fn reply_err(what: &str, e: ReplyError) -> ExchangeError {
    match e {
        ReplyError::ConnectionError(e) => conn_err(what, e),
        ReplyError::X11Error(e) => ExchangeError::Protocol(format!("{what}: {e:?}")),
    }
}

/// [`X11Transport`] over a live display connection.
pub struct X11Connection {
    conn: RustConnection,
    window: Window,
    atoms: RefCell<HashMap<String, Atom>>,
}

impl X11Connection {
    /// Connect to `$DISPLAY` and create the hidden 1×1 window that owns
    /// our selections and acts as the drop target. It advertises
    /// `xdnd_version` through `XdndAware`.
    pub fn connect(xdnd_version: u32) -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(None)
            .map_err(|e| ExchangeError::Connection(format!("X11 connect failed: {e}")))?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let root_visual = screen.root_visual;

        let window = conn
            .generate_id()
            .map_err(|e| ExchangeError::Connection(format!("generate_id: {e}")))?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            root_visual,
            &CreateWindowAux::new()
                .event_mask(EventMask::PROPERTY_CHANGE | EventMask::STRUCTURE_NOTIFY),
        )
        .map_err(|e| conn_err("create_window", e))?
        .check()
        .map_err(|e| reply_err("create_window", e))?;

        let this = Self {
            conn,
            window,
            atoms: RefCell::new(HashMap::new()),
        };
        let aware = this.intern_atom("XdndAware")?;
        this.change_property(window, aware, AtomEnum::ATOM.into(), 32, &pack32(&[xdnd_version]))?;
        this.flush()?;

        tracing::debug!(window, screen = screen_num, "X11 exchange window created");
        Ok(this)
    }

    /// Block until the connection is readable or `timeout_ms` elapses.
    /// Returns whether anything arrived.
    pub fn wait_readable(&self, timeout_ms: u16) -> Result<bool> {
        let raw_fd = self.conn.stream().as_raw_fd();
        // SAFETY: raw_fd is the X11 connection fd, valid while conn is alive.
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::Error::EINTR) => Ok(false),
            Err(e) => Err(ExchangeError::Connection(format!("poll on X11 fd: {e}"))),
        }
    }

    /// Next queued event, without blocking.
    pub fn poll_event(&self) -> Result<Option<Event>> {
        self.conn
            .poll_for_event()
            .map_err(|e| conn_err("poll_for_event", e))
    }
}

impl X11Transport for X11Connection {
    fn window(&self) -> Window {
        self.window
    }

    fn intern_atom(&self, name: &str) -> Result<Atom> {
        if let Some(&atom) = self.atoms.borrow().get(name) {
            return Ok(atom);
        }
        let atom = self
            .conn
            .intern_atom(false, name.as_bytes())
            .map_err(|e| conn_err("intern_atom", e))?
            .reply()
            .map_err(|e| reply_err("intern_atom reply", e))?
            .atom;
        self.atoms.borrow_mut().insert(name.to_string(), atom);
        Ok(atom)
    }

    fn atom_name(&self, atom: Atom) -> Result<String> {
        let reply = self
            .conn
            .get_atom_name(atom)
            .map_err(|e| conn_err("get_atom_name", e))?
            .reply()
            .map_err(|e| reply_err("get_atom_name reply", e))?;
        Ok(String::from_utf8_lossy(&reply.name).into_owned())
    }

    fn set_selection_owner(&self, selection: Atom, time: Timestamp) -> Result<()> {
        self.conn
            .set_selection_owner(self.window, selection, time)
            .map_err(|e| conn_err("set_selection_owner", e))?;
        Ok(())
    }

    fn clear_selection_owner(&self, selection: Atom, time: Timestamp) -> Result<()> {
        self.conn
            .set_selection_owner(x11rb::NONE, selection, time)
            .map_err(|e| conn_err("set_selection_owner", e))?;
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window> {
        Ok(self
            .conn
            .get_selection_owner(selection)
            .map_err(|e| conn_err("get_selection_owner", e))?
            .reply()
            .map_err(|e| reply_err("get_selection_owner reply", e))?
            .owner)
    }

    fn convert_selection(
        &self,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()> {
        self.conn
            .convert_selection(self.window, selection, target, property, time)
            .map_err(|e| conn_err("convert_selection", e))?;
        Ok(())
    }

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<()> {
        let unit = u32::from(format / 8).max(1);
        let len = u32::try_from(data.len())
            .map_err(|_| ExchangeError::Protocol("property too large".into()))?
            / unit;
        self.conn
            .change_property(PropMode::REPLACE, window, property, type_, format, len, data)
            .map_err(|e| conn_err("change_property", e))?;
        Ok(())
    }

    fn get_property(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<PropertyValue>> {
        let reply = self
            .conn
            .get_property(delete, window, property, AtomEnum::ANY, 0, u32::MAX / 4)
            .map_err(|e| conn_err("get_property", e))?
            .reply()
            .map_err(|e| reply_err("get_property reply", e))?;
        if reply.type_ == x11rb::NONE {
            return Ok(None);
        }
        Ok(Some(PropertyValue {
            type_: reply.type_,
            format: reply.format,
            data: reply.value,
        }))
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<()> {
        self.conn
            .delete_property(window, property)
            .map_err(|e| conn_err("delete_property", e))?;
        Ok(())
    }

    fn send_selection_notify(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()> {
        let event = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time,
            requestor,
            selection,
            target,
            property,
        };
        self.conn
            .send_event(false, requestor, EventMask::NO_EVENT, event)
            .map_err(|e| conn_err("send_event selection notify", e))?;
        Ok(())
    }

    fn send_client_message(
        &self,
        destination: Window,
        window: Window,
        type_: Atom,
        data: [u32; 5],
    ) -> Result<()> {
        let event = ClientMessageEvent::new(32, window, type_, data);
        self.conn
            .send_event(false, destination, EventMask::NO_EVENT, event)
            .map_err(|e| conn_err("send_event client message", e))?;
        Ok(())
    }

    fn watch_properties(&self, window: Window) -> Result<()> {
        self.conn
            .change_window_attributes(
                window,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
            )
            .map_err(|e| conn_err("change_window_attributes", e))?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.conn.flush().map_err(|e| conn_err("flush", e))
    }
}

impl Drop for X11Connection {
    fn drop(&mut self) {
        if let Err(e) = xproto::destroy_window(&self.conn, self.window) {
            tracing::debug!(error = %e, "destroy_window failed");
        }
        let _ = self.conn.flush();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A recording transport with a fake atom table.

    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;

    pub const OUR_WINDOW: Window = 0x100;

    /// One recorded outbound request.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        SetOwner(Atom),
        ClearOwner(Atom),
        Convert {
            selection: Atom,
            target: Atom,
            property: Atom,
            time: Timestamp,
        },
        Notify {
            requestor: Window,
            selection: Atom,
            target: Atom,
            property: Atom,
        },
        Client {
            destination: Window,
            type_: Atom,
            data: [u32; 5],
        },
        Watch(Window),
    }

    #[derive(Default)]
    pub struct FakeTransport {
        atoms: RefCell<HashMap<String, Atom>>,
        pub sent: RefCell<Vec<Sent>>,
        pub properties: RefCell<HashMap<(Window, Atom), PropertyValue>>,
        pub owners: RefCell<HashMap<Atom, Window>>,
    }

    impl FakeTransport {
        pub fn atom(&self, name: &str) -> Atom {
            let mut atoms = self.atoms.borrow_mut();
            let next = atoms.len() as Atom + 1;
            *atoms.entry(name.to_string()).or_insert(next)
        }

        pub fn take_sent(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.borrow_mut())
        }

        pub fn property(&self, window: Window, property: Atom) -> Option<PropertyValue> {
            self.properties.borrow().get(&(window, property)).cloned()
        }

        pub fn set_property(&self, window: Window, property: Atom, type_: Atom, format: u8, data: Vec<u8>) {
            self.properties.borrow_mut().insert(
                (window, property),
                PropertyValue {
                    type_,
                    format,
                    data,
                },
            );
        }

        /// Client messages sent so far, by type name.
        pub fn client_messages(&self) -> Vec<(String, [u32; 5])> {
            self.sent
                .borrow()
                .iter()
                .filter_map(|s| match s {
                    Sent::Client { type_, data, .. } => {
                        Some((self.atom_name(*type_).unwrap_or_default(), *data))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl X11Transport for FakeTransport {
        fn window(&self) -> Window {
            OUR_WINDOW
        }

        fn intern_atom(&self, name: &str) -> Result<Atom> {
            Ok(self.atom(name))
        }

        fn atom_name(&self, atom: Atom) -> Result<String> {
            self.atoms
                .borrow()
                .iter()
                .find(|(_, a)| **a == atom)
                .map(|(n, _)| n.clone())
                .ok_or_else(|| ExchangeError::Protocol(format!("BadAtom {atom}")))
        }

        fn set_selection_owner(&self, selection: Atom, _time: Timestamp) -> Result<()> {
            self.owners.borrow_mut().insert(selection, OUR_WINDOW);
            self.sent.borrow_mut().push(Sent::SetOwner(selection));
            Ok(())
        }

        fn clear_selection_owner(&self, selection: Atom, _time: Timestamp) -> Result<()> {
            self.owners.borrow_mut().remove(&selection);
            self.sent.borrow_mut().push(Sent::ClearOwner(selection));
            Ok(())
        }

        fn selection_owner(&self, selection: Atom) -> Result<Window> {
            Ok(self
                .owners
                .borrow()
                .get(&selection)
                .copied()
                .unwrap_or(x11rb::NONE))
        }

        fn convert_selection(
            &self,
            selection: Atom,
            target: Atom,
            property: Atom,
            time: Timestamp,
        ) -> Result<()> {
            self.sent.borrow_mut().push(Sent::Convert {
                selection,
                target,
                property,
                time,
            });
            Ok(())
        }

        fn change_property(
            &self,
            window: Window,
            property: Atom,
            type_: Atom,
            format: u8,
            data: &[u8],
        ) -> Result<()> {
            self.set_property(window, property, type_, format, data.to_vec());
            Ok(())
        }

        fn get_property(
            &self,
            window: Window,
            property: Atom,
            delete: bool,
        ) -> Result<Option<PropertyValue>> {
            let mut props = self.properties.borrow_mut();
            if delete {
                Ok(props.remove(&(window, property)))
            } else {
                Ok(props.get(&(window, property)).cloned())
            }
        }

        fn delete_property(&self, window: Window, property: Atom) -> Result<()> {
            self.properties.borrow_mut().remove(&(window, property));
            Ok(())
        }

        fn send_selection_notify(
            &self,
            requestor: Window,
            selection: Atom,
            target: Atom,
            property: Atom,
            _time: Timestamp,
        ) -> Result<()> {
            self.sent.borrow_mut().push(Sent::Notify {
                requestor,
                selection,
                target,
                property,
            });
            Ok(())
        }

        fn send_client_message(
            &self,
            destination: Window,
            _window: Window,
            type_: Atom,
            data: [u32; 5],
        ) -> Result<()> {
            self.sent.borrow_mut().push(Sent::Client {
                destination,
                type_,
                data,
            });
            Ok(())
        }

        fn watch_properties(&self, window: Window) -> Result<()> {
            self.sent.borrow_mut().push(Sent::Watch(window));
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atoms_from_format32_property() {
        let value = PropertyValue {
            type_: 4,
            format: 32,
            data: pack32(&[7, 8, 9]),
        };
        assert_eq!(value.atoms(), vec![7, 8, 9]);

        let bytes = PropertyValue {
            type_: 4,
            format: 8,
            data: vec![1, 2, 3, 4],
        };
        assert!(bytes.atoms().is_empty());
    }

    #[test]
    fn fake_transport_interns_stably() {
        let fake = testing::FakeTransport::default();
        let a = fake.atom("TARGETS");
        let b = fake.atom("CLIPBOARD");
        assert_ne!(a, b);
        assert_eq!(fake.atom("TARGETS"), a);
        assert_eq!(fake.atom_name(b).unwrap(), "CLIPBOARD");
    }
}
