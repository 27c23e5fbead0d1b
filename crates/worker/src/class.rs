/// Execution classes used to label spawned tasks in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// The hub dispatcher routing events to session workers.
	Dispatcher,
	/// A per-session serialized worker.
	Session,
	/// A forwarder draining one client's output mailbox.
	ClientOutput,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Dispatcher => "dispatcher",
			Self::Session => "session",
			Self::ClientOutput => "client_output",
		}
	}
}
