//! Request routing: host/path/method matchers and the route table built from `apiEndpoints`

pub mod matcher;
pub mod router;

pub use matcher::{HostPattern, MethodFilter, PathMatcher, PathTemplate};
pub use router::{EndpointRule, RouteMatch, RouteTable, RouteTableBuilder};
