//! Message filtering and rewriting.
//!
//! The engine has two symmetric entry points: [`FilterEngine::on_client_message`]
//! for traffic from the untrusted peer toward the bus, and
//! [`FilterEngine::on_bus_message`] for the reverse direction. Both take
//! an already-decoded header plus the owned buffer and decide to pass it
//! unchanged, drop it, or replace it, updating the connection state as a
//! side effect.
//!
//! # Denial is never silent
//!
//! A denied call that expected a reply must not leave the client's
//! reply-waiting logic hanging, and fabricating a reply out of band
//! would break the bus's serial ordering. Instead the proxy performs a
//! round trip: a harmless `Ping` with the *same serial* is sent to the
//! bus in place of the original, the synthesized error is stashed, and
//! when the bus answers the ping the stashed reply is swapped in, taking
//! over the real reply's serial. The client observes a perfectly
//! ordinary error from the bus's own serial sequence.
//!
//! # Policy learning
//!
//! Unique ids start at NONE and are raised as they are observed to own
//! or reply from named services: the `Hello` reply grants the client's
//! own id TALK, a successful reply from a well-known destination raises
//! the replying unique id to that name's level, `GetNameOwner` replies
//! raise the disclosed owner, and forwarded `NameOwnerChanged` signals
//! raise both the old and new owners.

use busfence_core::body::{first_string_arg, BodyReader, BodyWriter};
use busfence_core::policy::PolicyLevel;
use busfence_core::wire::{
    patch_serial, Header, MessageBuilder, MessageKind, BUS_INTERFACE, BUS_NAME, BUS_PATH,
    PEER_INTERFACE,
};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::connection::{ConnectionState, ExpectedReply, UNIQUE_NAME_SIGIL};
use crate::error::{ProxyError, ProxyResult};

const ERROR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

/// Placeholder serial for stashed synthesized replies.
///
/// Overwritten with the real bus reply's serial when the round trip
/// completes, so it never reaches the client.
const SYNTHETIC_SERIAL: u32 = 1;

/// What to do with a fully-buffered message.
#[derive(Debug)]
pub enum Verdict {
    /// Enqueue this buffer on the opposite side.
    ///
    /// This is either the original buffer, a `Ping` standing in for a
    /// denied request, or a rewritten reply.
    Forward(Buffer),
    /// Free the buffer; nothing is sent.
    Drop,
}

/// How the decision table treats a method on the bus's own name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusMethod {
    /// The `Hello` registration call.
    Hello,
    /// Passed through unchanged.
    Pass,
    /// Always denied.
    Deny,
    /// Allowed only if the first body argument resolves to at least the
    /// given level.
    NeedsArg0(PolicyLevel),
    /// Passed through; the reply is scrubbed of names below SEE.
    NameList,
}

fn classify_bus_method(member: &str) -> BusMethod {
    match member {
        "Hello" => BusMethod::Hello,
        "AddMatch" | "RemoveMatch" | "GetId" => BusMethod::Pass,
        "UpdateActivationEnvironment" | "BecomeMonitor" => BusMethod::Deny,
        "RequestName" | "ReleaseName" | "ListQueuedOwners" => {
            BusMethod::NeedsArg0(PolicyLevel::Own)
        }
        "NameHasOwner"
        | "GetNameOwner"
        | "GetConnectionUnixProcessID"
        | "GetConnectionUnixUser"
        | "GetConnectionCredentials"
        | "GetConnectionSELinuxSecurityContext"
        | "GetConnectionAuditSessionData" => BusMethod::NeedsArg0(PolicyLevel::See),
        "StartServiceByName" => BusMethod::NeedsArg0(PolicyLevel::Talk),
        "ListNames" | "ListActivatableNames" => BusMethod::NameList,
        _ => BusMethod::Deny,
    }
}

/// The per-connection filter/rewrite engine.
///
/// Stateless itself; all mutable state lives in the
/// [`ConnectionState`] handed to each call.
#[derive(Debug, Clone, Copy)]
pub struct FilterEngine {
    filter: bool,
    log_messages: bool,
}

impl FilterEngine {
    /// Creates an engine.
    ///
    /// With `filter` off the proxy is a transparent relay: messages are
    /// still framed and serial discipline is still enforced, but no
    /// policy decision is made.
    #[must_use]
    pub const fn new(filter: bool, log_messages: bool) -> Self {
        Self {
            filter,
            log_messages,
        }
    }

    fn log(&self, side: &'static str, header: &Header) {
        if self.log_messages {
            debug!(
                side,
                kind = %header.kind,
                serial = header.serial,
                path = header.path.as_deref().unwrap_or(""),
                member = header.member.as_deref().unwrap_or(""),
                destination = header.destination.as_deref().unwrap_or(""),
                sender = header.sender.as_deref().unwrap_or(""),
                "bus message"
            );
        }
    }

    /// Filters one message from the untrusted client toward the bus.
    ///
    /// # Errors
    ///
    /// Any returned error is fatal for the connection: serial
    /// regression, bus-driver impersonation, a malformed body argument,
    /// or correlation-map overflow.
    pub fn on_client_message(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        buffer: Buffer,
    ) -> ProxyResult<Verdict> {
        state.note_serial(header.serial)?;
        self.log("client", header);

        if !self.filter {
            return Ok(Verdict::Forward(buffer));
        }

        // A reply from the client answers a call the bus delivered to
        // it earlier; correlation, not destination policy, is what
        // gates it. The caller's unique id may well still be at NONE.
        if header.kind.is_reply() {
            if let Some(reply_serial) = header.reply_serial {
                if state.steal_client_reply(reply_serial) {
                    return Ok(Verdict::Forward(buffer));
                }
            }
        }

        // A client may call the bus driver, but may never pretend to
        // *be* it: signals claiming the driver's path or interface
        // would let the sandbox forge NameOwnerChanged and friends.
        if header.kind == MessageKind::Signal
            && (header.path.as_deref() == Some(BUS_PATH)
                || header.interface.as_deref() == Some(BUS_INTERFACE))
        {
            return Err(ProxyError::BusImpersonation);
        }

        if header.destination.as_deref() == Some(BUS_NAME) {
            if header.kind == MessageKind::MethodCall {
                return self.on_client_bus_call(state, header, buffer);
            }
            // Non-call traffic addressed to the driver (stray replies,
            // mostly) is harmless; the driver ignores what it does not
            // expect.
            return Ok(Verdict::Forward(buffer));
        }

        let destination = header.destination.as_deref();
        let level = state.resolve_effective(destination);
        if level >= PolicyLevel::Talk {
            self.track_passed_call(state, header)?;
            return Ok(Verdict::Forward(buffer));
        }

        drop(buffer);
        if level >= PolicyLevel::See {
            // Visible but not callable.
            self.synthesize_denial(
                state,
                header,
                ERROR_ACCESS_DENIED,
                format!(
                    "busfence policy denies talking to {}",
                    destination.unwrap_or("(unnamed)")
                ),
            )
        } else {
            // Hidden: answer exactly as the bus would for a name that
            // does not exist.
            let looks_unique = destination
                .is_some_and(|name| name.starts_with(UNIQUE_NAME_SIGIL));
            let error_name = if looks_unique || header.no_auto_start() {
                ERROR_NAME_HAS_NO_OWNER
            } else {
                ERROR_SERVICE_UNKNOWN
            };
            self.synthesize_denial(
                state,
                header,
                error_name,
                format!(
                    "The name {} was not provided by any .service files",
                    destination.unwrap_or("(unnamed)")
                ),
            )
        }
    }

    /// Applies the fixed decision table for method calls on the bus's
    /// own name.
    fn on_client_bus_call(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        buffer: Buffer,
    ) -> ProxyResult<Verdict> {
        let member = header.member.as_deref().unwrap_or("");
        match classify_bus_method(member) {
            BusMethod::Hello => {
                self.track(state, header, ExpectedReply::Hello)?;
                Ok(Verdict::Forward(buffer))
            }
            BusMethod::Pass => {
                self.track(state, header, ExpectedReply::Plain)?;
                Ok(Verdict::Forward(buffer))
            }
            BusMethod::NameList => {
                self.track(state, header, ExpectedReply::NameList)?;
                Ok(Verdict::Forward(buffer))
            }
            BusMethod::Deny => {
                debug!(member, "denying bus method");
                drop(buffer);
                self.synthesize_denial(
                    state,
                    header,
                    ERROR_ACCESS_DENIED,
                    format!("busfence policy denies calling {member}"),
                )
            }
            BusMethod::NeedsArg0(required) => {
                let name = first_string_arg(header, buffer.bytes())?;
                let level = state.resolve_effective(Some(&name));
                if level >= required {
                    let kind = if member == "GetNameOwner" {
                        ExpectedReply::GetNameOwner { name }
                    } else {
                        ExpectedReply::Plain
                    };
                    self.track(state, header, kind)?;
                    return Ok(Verdict::Forward(buffer));
                }
                debug!(member, name = %name, level = %level, required = %required, "denying bus method on argument policy");
                drop(buffer);
                if level < PolicyLevel::See {
                    // The name must appear not to exist at all. An
                    // existence check gets the bus's negative answer, a
                    // boolean false; everything else gets the error the
                    // bus raises for an ownerless name.
                    if member == "NameHasOwner" {
                        return self.synthesize_bool_reply(state, header, false);
                    }
                    self.synthesize_denial(
                        state,
                        header,
                        ERROR_NAME_HAS_NO_OWNER,
                        format!("Could not get owner of name '{name}': no such name"),
                    )
                } else {
                    self.synthesize_denial(
                        state,
                        header,
                        ERROR_ACCESS_DENIED,
                        format!("busfence policy denies {member} on {name}"),
                    )
                }
            }
        }
    }

    /// Records reply expectations for a message passed through
    /// unchanged toward a non-bus destination.
    fn track_passed_call(
        &self,
        state: &mut ConnectionState,
        header: &Header,
    ) -> ProxyResult<()> {
        if !header.expects_reply() {
            return Ok(());
        }
        state.expect_reply(header.serial, ExpectedReply::Plain)?;
        if let Some(destination) = header.destination.as_deref() {
            // A reply from a well-known destination will come back
            // signed with the owner's unique id; remember the name so
            // the reply can teach us who owns it.
            if !destination.starts_with(UNIQUE_NAME_SIGIL) {
                state.note_owner_query(header.serial, destination);
            }
        }
        Ok(())
    }

    fn track(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        kind: ExpectedReply,
    ) -> ProxyResult<()> {
        if header.expects_reply() {
            state.expect_reply(header.serial, kind)?;
        }
        Ok(())
    }

    /// Replaces a denied request with a round trip.
    ///
    /// If the request expected a reply, a `Ping` with the same serial
    /// goes to the bus and the synthesized error is stashed until the
    /// ping's reply arrives. A no-reply request is simply dropped.
    fn synthesize_denial(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        error_name: &str,
        text: String,
    ) -> ProxyResult<Verdict> {
        if !header.expects_reply() {
            warn!(
                serial = header.serial,
                error_name, "dropping denied no-reply message"
            );
            return Ok(Verdict::Drop);
        }

        let mut body = BodyWriter::new(header.endian);
        body.put_string(&text);
        let mut error = MessageBuilder::new(header.endian, MessageKind::Error, SYNTHETIC_SERIAL)
            .error_name(error_name)
            .reply_serial(header.serial)
            .sender(BUS_NAME)
            .signature("s")
            .body(body.finish());
        if let Some(client_id) = state.client_id() {
            error = error.destination(client_id);
        }
        let reply = error.build();
        self.stash_round_trip(state, header, reply)
    }

    /// Replaces a denied `NameHasOwner` with a round trip answering
    /// `value`, exactly as the bus answers for a name with no owner.
    fn synthesize_bool_reply(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        value: bool,
    ) -> ProxyResult<Verdict> {
        if !header.expects_reply() {
            warn!(serial = header.serial, "dropping denied no-reply message");
            return Ok(Verdict::Drop);
        }

        let mut body = BodyWriter::new(header.endian);
        body.put_u32(u32::from(value));
        let mut reply =
            MessageBuilder::new(header.endian, MessageKind::MethodReturn, SYNTHETIC_SERIAL)
                .reply_serial(header.serial)
                .sender(BUS_NAME)
                .signature("b")
                .body(body.finish());
        if let Some(client_id) = state.client_id() {
            reply = reply.destination(client_id);
        }
        let reply = reply.build();
        self.stash_round_trip(state, header, reply)
    }

    /// Stashes a synthesized reply and emits the `Ping` that will fetch
    /// a serial for it.
    fn stash_round_trip(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        reply: Vec<u8>,
    ) -> ProxyResult<Verdict> {
        state.expect_reply(header.serial, ExpectedReply::Synthetic)?;
        state.stash_synthetic(header.serial, Buffer::from_bytes(reply));

        let ping = MessageBuilder::new(header.endian, MessageKind::MethodCall, header.serial)
            .flags(header.flags)
            .path("/")
            .interface(PEER_INTERFACE)
            .member("Ping")
            .destination(BUS_NAME)
            .build();
        Ok(Verdict::Forward(Buffer::from_bytes(ping)))
    }

    /// Filters one message from the trusted bus toward the client.
    ///
    /// # Errors
    ///
    /// Errors here indicate either a malformed message from the bus
    /// (which is trusted, so this points at an internal bug) or
    /// correlation-map overflow; both are fatal.
    pub fn on_bus_message(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        buffer: Buffer,
    ) -> ProxyResult<Verdict> {
        self.log("bus", header);

        if !self.filter {
            return Ok(Verdict::Forward(buffer));
        }

        match header.kind {
            MessageKind::MethodReturn | MessageKind::Error => {
                self.on_bus_reply(state, header, buffer)
            }
            MessageKind::Signal => self.on_bus_signal(state, header, buffer),
            // An incoming call from another peer. Reaching the client
            // at all required the caller to hold TALK on something the
            // client owns; its serial is remembered so the client's
            // reply can be matched on the way back.
            MessageKind::MethodCall => {
                if header.expects_reply() {
                    state.expect_client_reply(header.serial)?;
                }
                Ok(Verdict::Forward(buffer))
            }
        }
    }

    fn on_bus_reply(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        buffer: Buffer,
    ) -> ProxyResult<Verdict> {
        // Decode guarantees a reply serial on returns and errors.
        let reply_serial = header.reply_serial.unwrap_or(0);

        let Some(expectation) = state.steal_expectation(reply_serial) else {
            // Unsolicited replies are never forwarded. The bus side is
            // trusted, so this mostly guards our own bookkeeping.
            warn!(reply_serial, "dropping reply with no recorded expectation");
            return Ok(Verdict::Drop);
        };

        // If this serial was a call to a well-known name, a successful
        // reply discloses the unique id that currently owns it.
        if let Some(name) = state.steal_owner_query(reply_serial) {
            if header.kind == MessageKind::MethodReturn {
                if let Some(sender) = header.sender.as_deref() {
                    if sender.starts_with(UNIQUE_NAME_SIGIL) {
                        let level = state.policy().resolve(Some(&name));
                        state.raise_unique_policy(sender, level);
                    }
                }
            }
        }

        match expectation {
            ExpectedReply::Plain => Ok(Verdict::Forward(buffer)),
            ExpectedReply::Hello => {
                if header.kind == MessageKind::MethodReturn {
                    let body = header.body_region(buffer.bytes())?;
                    let unique_id = BodyReader::new(header.endian, body)
                        .read_string()?
                        .to_owned();
                    state.raise_unique_policy(&unique_id, PolicyLevel::Talk);
                    state.set_client_id(unique_id);
                }
                Ok(Verdict::Forward(buffer))
            }
            ExpectedReply::GetNameOwner { name } => {
                if header.kind == MessageKind::MethodReturn {
                    let body = header.body_region(buffer.bytes())?;
                    let owner = BodyReader::new(header.endian, body).read_string()?;
                    if owner.starts_with(UNIQUE_NAME_SIGIL) {
                        let level = state.policy().resolve(Some(&name));
                        state.raise_unique_policy(owner, level);
                    }
                }
                Ok(Verdict::Forward(buffer))
            }
            ExpectedReply::NameList => {
                if header.kind != MessageKind::MethodReturn {
                    return Ok(Verdict::Forward(buffer));
                }
                self.rewrite_name_list(state, header, &buffer)
            }
            ExpectedReply::Synthetic => {
                let Some(mut synthetic) = state.steal_synthetic(reply_serial) else {
                    warn!(reply_serial, "round-trip reply without stashed synthetic");
                    return Ok(Verdict::Drop);
                };
                drop(buffer);
                // The synthesized reply takes over the real reply's
                // serial so the client sees the bus's own sequence.
                patch_serial(synthetic.bytes_mut(), header.serial)?;
                Ok(Verdict::Forward(synthetic))
            }
        }
    }

    /// Rewrites a `ListNames`-family reply to the subset of names the
    /// client may see.
    fn rewrite_name_list(
        &self,
        state: &ConnectionState,
        header: &Header,
        buffer: &Buffer,
    ) -> ProxyResult<Verdict> {
        let body = header.body_region(buffer.bytes())?;
        let names = BodyReader::new(header.endian, body).read_string_array()?;
        let visible: Vec<&str> = names
            .into_iter()
            .filter(|name| state.resolve_effective(Some(*name)) >= PolicyLevel::See)
            .collect();

        let mut new_body = BodyWriter::new(header.endian);
        new_body.put_string_array(&visible);
        let mut rewritten =
            MessageBuilder::new(header.endian, MessageKind::MethodReturn, header.serial)
                .flags(header.flags)
                .reply_serial(header.reply_serial.unwrap_or(0))
                .signature("as")
                .body(new_body.finish());
        if let Some(sender) = &header.sender {
            rewritten = rewritten.sender(sender.clone());
        }
        if let Some(destination) = &header.destination {
            rewritten = rewritten.destination(destination.clone());
        }
        Ok(Verdict::Forward(Buffer::from_bytes(rewritten.build())))
    }

    fn on_bus_signal(
        &self,
        state: &mut ConnectionState,
        header: &Header,
        buffer: Buffer,
    ) -> ProxyResult<Verdict> {
        // NameOwnerChanged both leaks and teaches: it is forwarded only
        // for names above SEE, and forwarding ratchets the old and new
        // owners up to the name's level.
        if header.sender.as_deref() == Some(BUS_NAME)
            && header.interface.as_deref() == Some(BUS_INTERFACE)
            && header.member.as_deref() == Some("NameOwnerChanged")
        {
            let body = header.body_region(buffer.bytes())?;
            let mut reader = BodyReader::new(header.endian, body);
            let name = reader.read_string()?.to_owned();
            let old_owner = reader.read_string()?.to_owned();
            let new_owner = reader.read_string()?.to_owned();

            let level = state.resolve_effective(Some(&name));
            if level <= PolicyLevel::See {
                debug!(name = %name, "suppressing NameOwnerChanged");
                return Ok(Verdict::Drop);
            }
            if !old_owner.is_empty() {
                state.raise_unique_policy(&old_owner, level);
            }
            if !new_owner.is_empty() {
                state.raise_unique_policy(&new_owner, level);
            }
            return Ok(Verdict::Forward(buffer));
        }

        // Broadcasts are only delivered from peers the client could
        // talk to directly; the bus driver itself is always audible.
        if header.destination.is_none() {
            let sender = header.sender.as_deref();
            let from_driver = sender.is_none() || sender == Some(BUS_NAME);
            if !from_driver && state.resolve_effective(sender) < PolicyLevel::Talk {
                debug!(
                    sender = sender.unwrap_or(""),
                    member = header.member.as_deref().unwrap_or(""),
                    "suppressing broadcast from low-policy sender"
                );
                return Ok(Verdict::Drop);
            }
        }
        Ok(Verdict::Forward(buffer))
    }
}
