//! Typed wrappers for the bus daemon's `org.freedesktop.DBus` methods.

use crate::connection::Connection;
use crate::error::{BusError, BusResult};
use objbus_types::error::BuiltinError;
use objbus_types::names::{
    validate_bus_name, RELEASE_NAME_REPLY_NON_EXISTENT, RELEASE_NAME_REPLY_NOT_OWNER,
    RELEASE_NAME_REPLY_RELEASED, REQUEST_NAME_REPLY_ALREADY_OWNER, REQUEST_NAME_REPLY_EXISTS,
    REQUEST_NAME_REPLY_IN_QUEUE, REQUEST_NAME_REPLY_PRIMARY_OWNER,
};
use objbus_types::TypedValue;
use objbus_wire::MatchRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            REQUEST_NAME_REPLY_PRIMARY_OWNER => Some(Self::PrimaryOwner),
            REQUEST_NAME_REPLY_IN_QUEUE => Some(Self::InQueue),
            REQUEST_NAME_REPLY_EXISTS => Some(Self::Exists),
            REQUEST_NAME_REPLY_ALREADY_OWNER => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            RELEASE_NAME_REPLY_RELEASED => Some(Self::Released),
            RELEASE_NAME_REPLY_NON_EXISTENT => Some(Self::NonExistent),
            RELEASE_NAME_REPLY_NOT_OWNER => Some(Self::NotOwner),
            _ => None,
        }
    }
}

fn first_u32(body: &[TypedValue], member: &str) -> BusResult<u32> {
    body.first()
        .and_then(TypedValue::as_u32)
        .ok_or_else(|| BusError::UnexpectedReply(format!("{member} did not return a u32")))
}

fn first_str(body: Vec<TypedValue>, member: &str) -> BusResult<String> {
    body.into_iter()
        .next()
        .and_then(TypedValue::into_string)
        .ok_or_else(|| BusError::UnexpectedReply(format!("{member} did not return a string")))
}

impl Connection {
    /// Ask the daemon for ownership of `name`. `flags` are the
    /// `NAME_FLAG_*` bits.
    pub fn request_name(&self, name: &str, flags: u32) -> BusResult<RequestNameReply> {
        validate_bus_name(name)?;
        let body = self.daemon_call("RequestName", vec![name.into(), flags.into()])?;
        let code = first_u32(&body, "RequestName")?;
        RequestNameReply::from_code(code)
            .ok_or_else(|| BusError::UnexpectedReply(format!("RequestName reply code {code}")))
    }

    pub fn release_name(&self, name: &str) -> BusResult<ReleaseNameReply> {
        validate_bus_name(name)?;
        let body = self.daemon_call("ReleaseName", vec![name.into()])?;
        let code = first_u32(&body, "ReleaseName")?;
        ReleaseNameReply::from_code(code)
            .ok_or_else(|| BusError::UnexpectedReply(format!("ReleaseName reply code {code}")))
    }

    /// The unique name owning `name`, straight from the daemon. `None`
    /// when nobody owns it.
    pub fn get_name_owner(&self, name: &str) -> BusResult<Option<String>> {
        match self.daemon_call("GetNameOwner", vec![name.into()]) {
            Ok(body) => first_str(body, "GetNameOwner").map(Some),
            Err(e) if e.is(BuiltinError::NameHasNoOwner) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn name_has_owner(&self, name: &str) -> BusResult<bool> {
        let body = self.daemon_call("NameHasOwner", vec![name.into()])?;
        body.first()
            .and_then(TypedValue::as_bool)
            .ok_or_else(|| BusError::UnexpectedReply("NameHasOwner did not return a bool".into()))
    }

    pub fn list_names(&self) -> BusResult<Vec<String>> {
        let body = self.daemon_call("ListNames", Vec::new())?;
        body.into_iter()
            .next()
            .and_then(TypedValue::into_string_list)
            .map(|list| list.into_items())
            .ok_or_else(|| BusError::UnexpectedReply("ListNames did not return a list".into()))
    }

    pub fn add_match(&self, rule: &MatchRule) -> BusResult<()> {
        self.daemon_call("AddMatch", vec![rule.to_string().into()])
            .map(|_| ())
    }

    pub fn remove_match(&self, rule: &MatchRule) -> BusResult<()> {
        self.daemon_call("RemoveMatch", vec![rule.to_string().into()])
            .map(|_| ())
    }

    /// The bus's globally unique id.
    pub fn bus_id(&self) -> BusResult<String> {
        let body = self.daemon_call("GetId", Vec::new())?;
        first_str(body, "GetId")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use objbus_types::config::BusConfig;
    use objbus_types::names::{NAME_FLAG_ALLOW_REPLACEMENT, NAME_FLAG_DO_NOT_QUEUE};
    use objbus_wire::MemoryBus;

    const SVC: &str = "org.example.Daemon";

    fn pair() -> (EventLoop, Connection, Connection) {
        let bus = MemoryBus::new();
        let event_loop = EventLoop::new();
        let a = Connection::open_memory(&bus, &event_loop, BusConfig::default()).unwrap();
        let b = Connection::open_memory(&bus, &event_loop, BusConfig::default()).unwrap();
        (event_loop, a, b)
    }

    #[test]
    fn test_request_and_release() {
        let (_loop, a, b) = pair();
        assert_eq!(
            a.request_name(SVC, NAME_FLAG_ALLOW_REPLACEMENT).unwrap(),
            RequestNameReply::PrimaryOwner
        );
        assert_eq!(a.request_name(SVC, 0).unwrap(), RequestNameReply::AlreadyOwner);
        assert_eq!(
            b.request_name(SVC, NAME_FLAG_DO_NOT_QUEUE).unwrap(),
            RequestNameReply::Exists
        );
        assert_eq!(b.request_name(SVC, 0).unwrap(), RequestNameReply::InQueue);

        assert_eq!(b.get_name_owner(SVC).unwrap().as_deref(), Some(a.unique_name()));
        assert!(b.name_has_owner(SVC).unwrap());
        assert_eq!(b.release_name(SVC).unwrap(), ReleaseNameReply::Released);
        assert_eq!(a.release_name(SVC).unwrap(), ReleaseNameReply::Released);
        assert_eq!(a.release_name(SVC).unwrap(), ReleaseNameReply::NonExistent);
        assert_eq!(b.get_name_owner(SVC).unwrap(), None);
    }

    #[test]
    fn test_list_names_and_id() {
        let (_loop, a, b) = pair();
        a.request_name(SVC, 0).unwrap();
        let names = b.list_names().unwrap();
        assert!(names.iter().any(|n| n == SVC));
        assert!(names.iter().any(|n| n == b.unique_name()));
        assert!(!b.bus_id().unwrap().is_empty());
    }

    #[test]
    fn test_match_rules() {
        let (_loop, a, _b) = pair();
        let rule = MatchRule::parse("type='signal',interface='org.example.X'").unwrap();
        a.add_match(&rule).unwrap();
        a.remove_match(&rule).unwrap();
        let err = a.remove_match(&rule).unwrap_err();
        assert!(err.is(BuiltinError::MatchRuleNotFound));
    }

    #[test]
    fn test_invalid_name_is_rejected_locally() {
        let (_loop, a, _b) = pair();
        assert!(matches!(
            a.request_name("not a name", 0),
            Err(BusError::Types(_))
        ));
    }
}
