//! Request routing: map methods and path patterns to handler functions.
//!
//! A [`Router`] is an ordered list of rules built once, before serving
//! starts. Three kinds of pattern segment are supported:
//!
//! | Pattern              | Example match              | Captures                        |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `splat → "docs/readme.txt"`     |
//!
//! Patterns are anchored to the whole path. A `:name` segment matches one
//! non-empty path segment; a bare `*` matches the rest of the path, slashes
//! included. Every capture is also recorded positionally in
//! [`Env::args`](crate::context::Env::args).
//!
//! Routers can be mounted under a prefix with [`Router::mount`]. The mounted
//! router sees the request with the prefix stripped from its path; the
//! prefix is pushed onto the request's context trail and the original URI
//! is kept in the environment.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::Params;
use crate::http::{IntoResponse, Method, Request, Response, StatusCode};

/// Type-erased handler stored by the router.
pub type Handler = Arc<dyn Fn(Request) -> Response + Send + Sync + 'static>;

/// Conversion trait for handler functions.
///
/// Any `Fn(Request) -> impl IntoResponse` that is `Send + Sync + 'static`
/// implements it, so handlers can return a [`Response`], a status code, a
/// tuple or a plain body.
pub trait IntoHandler<T>: Send + Sync + 'static {
    fn call(&self, request: Request) -> Response;
}

impl<F, R> IntoHandler<R> for F
where
    F: Fn(Request) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    fn call(&self, request: Request) -> Response {
        (self)(request).into_response()
    }
}

// A single path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Parameter(String),
    Splat,
}

#[derive(Debug, Default)]
struct Captures {
    named: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Captures {
    fn push(&mut self, name: Option<&str>, value: String) {
        if let Some(name) = name {
            self.named.push((name.to_owned(), value.clone()));
        }
        self.positional.push(value);
    }

    fn truncate(&mut self, named: usize, positional: usize) {
        self.named.truncate(named);
        self.positional.truncate(positional);
    }
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .map(|s| match s {
                "*" => Segment::Splat,
                s if s.len() > 1 && s.starts_with(':') => Segment::Parameter(s[1..].to_owned()),
                s => Segment::Static(s.to_owned()),
            })
            .collect();
        Self {
            source: pattern.to_owned(),
            segments,
        }
    }

    // Matches the whole path.
    fn matches(&self, path: &str) -> Option<Captures> {
        let parts: Vec<&str> = path.split('/').collect();
        let mut caps = Captures::default();
        match_segments(&self.segments, &parts, &mut caps, false).map(|_| caps)
    }

    // Matches a prefix of the path; returns the captures, the matched prefix
    // and the remaining path.
    fn matches_prefix(&self, path: &str) -> Option<(Captures, String, String)> {
        let parts: Vec<&str> = path.split('/').collect();
        let mut caps = Captures::default();
        let used = match_segments(&self.segments, &parts, &mut caps, true)?;
        let prefix = parts[..used].join("/");
        let rest = format!("/{}", parts[used..].join("/"));
        Some((caps, prefix, rest))
    }
}

// Returns how many path parts were consumed. Without `prefix` every part
// must be consumed.
fn match_segments(
    segments: &[Segment],
    parts: &[&str],
    caps: &mut Captures,
    prefix: bool,
) -> Option<usize> {
    let Some((segment, rest)) = segments.split_first() else {
        return (prefix || parts.is_empty()).then_some(0);
    };
    match segment {
        Segment::Static(s) => {
            let (part, tail) = parts.split_first()?;
            if part != s {
                return None;
            }
            match_segments(rest, tail, caps, prefix).map(|n| n + 1)
        }
        Segment::Parameter(name) => {
            let (part, tail) = parts.split_first()?;
            if part.is_empty() {
                return None;
            }
            let mark = (caps.named.len(), caps.positional.len());
            caps.push(Some(name), (*part).to_owned());
            match match_segments(rest, tail, caps, prefix) {
                Some(n) => Some(n + 1),
                None => {
                    caps.truncate(mark.0, mark.1);
                    None
                }
            }
        }
        Segment::Splat => {
            // Longest match first.
            for take in (1..=parts.len()).rev() {
                let mark = (caps.named.len(), caps.positional.len());
                caps.push(Some("splat"), parts[..take].join("/"));
                if let Some(n) = match_segments(rest, &parts[take..], caps, prefix) {
                    return Some(n + take);
                }
                caps.truncate(mark.0, mark.1);
            }
            None
        }
    }
}

// A single registered route binding a method set + pattern to a handler.
struct Route {
    methods: Vec<Method>,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    // GET routes answer HEAD as well.
    fn accepts(&self, method: &Method) -> bool {
        self.methods.contains(method) || (*method == Method::Head && self.methods.contains(&Method::Get))
    }
}

enum Entry {
    Route(Route),
    Mount { pattern: Pattern, router: Router },
}

/// Dispatches requests to handlers by method and path.
///
/// Rules are tried in registration order; the first whose method set and
/// pattern both match wins. [`Router::handle`] answers `404 Not Found` when
/// nothing matches.
///
/// # Examples
///
/// ```
/// use httpony::http::{Method, Request, StatusCode, Uri};
/// use httpony::router::Router;
///
/// let mut router = Router::new();
/// router.get("/users/:id", |req: Request| {
///     format!("user {}", req.param("id").unwrap_or("?"))
/// });
///
/// let request = Request::new(Method::Get, Uri::parse("/users/42").unwrap());
/// let mut response = router.handle(request);
/// assert_eq!(response.status(), StatusCode::OK);
/// assert_eq!(response.force_body().unwrap().as_ref(), b"user 42");
/// ```
#[derive(Default)]
pub struct Router {
    entries: Vec<Entry>,
}

impl Router {
    /// Create a new, empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for any of `methods` on `pattern`.
    pub fn route<T: 'static>(
        &mut self,
        methods: &[Method],
        pattern: &str,
        handler: impl IntoHandler<T>,
    ) -> &mut Self {
        let handler: Handler = Arc::new(move |req| handler.call(req));
        self.entries.push(Entry::Route(Route {
            methods: methods.to_vec(),
            pattern: Pattern::parse(pattern),
            handler,
        }));
        self
    }

    /// Register a handler for `GET` (and therefore `HEAD`) requests.
    pub fn get<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Get], pattern, handler)
    }

    pub fn head<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Head], pattern, handler)
    }

    pub fn post<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Post], pattern, handler)
    }

    pub fn put<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Put], pattern, handler)
    }

    pub fn delete<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Delete], pattern, handler)
    }

    pub fn patch<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Patch], pattern, handler)
    }

    pub fn options<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&[Method::Options], pattern, handler)
    }

    /// Register a handler for every standard method.
    pub fn any<T: 'static>(&mut self, pattern: &str, handler: impl IntoHandler<T>) -> &mut Self {
        self.route(&Method::STANDARD, pattern, handler)
    }

    /// Mount `router` under `prefix`.
    ///
    /// The prefix may contain `:name` captures; they are recorded in
    /// [`Env::context_params`](crate::context::Env::context_params).
    pub fn mount(&mut self, prefix: &str, router: Router) -> &mut Self {
        let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
        self.entries.push(Entry::Mount {
            pattern: Pattern::parse(prefix),
            router,
        });
        self
    }

    /// Number of rules and mounts registered directly on this router.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the first matching handler, or hands the request back untouched
    /// when nothing matches.
    pub fn dispatch(&self, mut request: Request) -> Result<Response, Request> {
        let path = request.uri().path().to_owned();
        for entry in &self.entries {
            match entry {
                Entry::Route(route) => {
                    if !route.accepts(request.method()) {
                        continue;
                    }
                    let Some(caps) = route.pattern.matches(&path) else {
                        continue;
                    };
                    trace!(method = %request.method(), path = %path, pattern = %route.pattern.source, "route matched");
                    let mut params: Params = request.uri().query_params();
                    for (name, value) in caps.named {
                        params.insert(name, value);
                    }
                    let env = request.env_mut();
                    env.params = params;
                    env.args = caps.positional;
                    return Ok((route.handler)(request));
                }
                Entry::Mount { pattern, router } => {
                    let Some((caps, prefix, rest)) = pattern.matches_prefix(&path) else {
                        continue;
                    };
                    trace!(path = %path, prefix = %prefix, "entering mounted router");
                    request = match self.enter_mount(request, router, caps, prefix, &rest) {
                        Ok(response) => return Ok(response),
                        Err(request) => request,
                    };
                }
            }
        }
        Err(request)
    }

    fn enter_mount(
        &self,
        mut request: Request,
        router: &Router,
        caps: Captures,
        prefix: String,
        rest: &str,
    ) -> Result<Response, Request> {
        let saved_uri = request.uri().clone();
        let saved_params = request.env().context_params.clone();
        let set_original = request.env().original_uri.is_none();

        let env = request.env_mut();
        if set_original {
            env.original_uri = Some(saved_uri.clone());
        }
        env.context.push(prefix);
        for (name, value) in caps.named {
            env.context_params.insert(name, value);
        }
        let mut uri = saved_uri.clone();
        uri.set_path(rest);
        request.set_uri(uri);

        router.dispatch(request).map_err(|mut request| {
            request.set_uri(saved_uri);
            let env = request.env_mut();
            env.context.pop();
            env.context_params = saved_params;
            if set_original {
                env.original_uri = None;
            }
            request
        })
    }

    /// Dispatches `request`, answering `404 Not Found` when no rule matches.
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(request) => {
                trace!(method = %request.method(), path = %request.uri().path(), "no route matched");
                Response::from_status(StatusCode::NOT_FOUND)
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for entry in &self.entries {
            match entry {
                Entry::Route(route) => {
                    list.entry(&format_args!("{:?} {}", route.methods, route.pattern.source));
                }
                Entry::Mount { pattern, router } => {
                    list.entry(&format_args!("mount {} {:?}", pattern.source, router));
                }
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Uri;

    fn make_request(method: &str, target: &str) -> Request {
        Request::new(Method::from(method), Uri::parse(target).unwrap())
            .with_header("Host", "localhost")
    }

    fn body(mut response: Response) -> String {
        String::from_utf8(response.force_body().unwrap().to_vec()).unwrap()
    }

    // ── Pattern ───────────────────────────────────────────────────────────────

    #[test]
    fn pattern_parse_segments() {
        let pat = Pattern::parse("/users/:id/*");
        assert_eq!(
            pat.segments,
            vec![
                Segment::Static(String::new()),
                Segment::Static("users".into()),
                Segment::Parameter("id".into()),
                Segment::Splat,
            ]
        );
    }

    #[test]
    fn pattern_exact_match() {
        let pat = Pattern::parse("/users");
        assert!(pat.matches("/users").is_some());
        assert!(pat.matches("/posts").is_none());
        assert!(pat.matches("/users/").is_none());
        assert!(Pattern::parse("/").matches("/").is_some());
        assert!(Pattern::parse("/").matches("/other").is_none());
    }

    #[test]
    fn pattern_param_extracts_values() {
        let pat = Pattern::parse("/users/:id/posts/:post_id");
        let caps = pat.matches("/users/7/posts/99").unwrap();
        assert_eq!(
            caps.named,
            vec![("id".into(), "7".into()), ("post_id".into(), "99".into())]
        );
        assert_eq!(caps.positional, vec!["7", "99"]);
        assert!(pat.matches("/users/7/posts").is_none());
        assert!(pat.matches("/users//posts/99").is_none());
    }

    #[test]
    fn splat_spans_slashes() {
        let caps = Pattern::parse("/files/*").matches("/files/docs/readme.txt").unwrap();
        assert_eq!(caps.positional, vec!["docs/readme.txt"]);
        let caps = Pattern::parse("/*").matches("/").unwrap();
        assert_eq!(caps.positional, vec![""]);
    }

    #[test]
    fn splat_backtracks() {
        let caps = Pattern::parse("/a/*/edit").matches("/a/x/y/edit").unwrap();
        assert_eq!(caps.positional, vec!["x/y"]);
        assert!(Pattern::parse("/a/*/edit").matches("/a/x/y").is_none());
    }

    #[test]
    fn prefix_match_returns_rest() {
        let pat = Pattern::parse("/api/:version");
        let (caps, prefix, rest) = pat.matches_prefix("/api/v1/users/42").unwrap();
        assert_eq!(caps.named, vec![("version".into(), "v1".into())]);
        assert_eq!(prefix, "/api/v1");
        assert_eq!(rest, "/users/42");
        let (_, _, rest) = pat.matches_prefix("/api/v1").unwrap();
        assert_eq!(rest, "/");
        assert!(Pattern::parse("/api").matches_prefix("/apiary").is_none());
    }

    // ── Router ────────────────────────────────────────────────────────────────

    #[test]
    fn router_starts_empty() {
        let router = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn router_empty_returns_404() {
        let router = Router::new();
        assert_eq!(
            router.handle(make_request("GET", "/")).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn rules_match_in_order() {
        let mut router = Router::new();
        router
            .get("/foo/:id", |req: Request| {
                format!("foo {}", req.param("id").unwrap_or(""))
            })
            .get("/nothing/to/see", |_req: Request| "move along")
            .any("/*", |req: Request| {
                format!("any {} {}", req.method(), req.env().args.join(","))
            });

        assert_eq!(body(router.handle(make_request("GET", "/foo/42"))), "foo 42");
        assert_eq!(
            body(router.handle(make_request("GET", "/nothing/to/see"))),
            "move along"
        );
        assert_eq!(
            body(router.handle(make_request("POST", "/some/where"))),
            "any POST some/where"
        );
    }

    #[test]
    fn get_rules_answer_head() {
        let mut router = Router::new();
        router.get("/hello", |_req: Request| StatusCode::OK);
        assert_eq!(
            router.handle(make_request("HEAD", "/hello")).status(),
            StatusCode::OK
        );
        assert_eq!(
            router.handle(make_request("POST", "/hello")).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/path", |_req: Request| StatusCode::OK);
        router.get("/path", |_req: Request| StatusCode::ACCEPTED);
        assert_eq!(router.handle(make_request("GET", "/path")).status(), StatusCode::OK);
    }

    #[test]
    fn path_captures_override_query_params() {
        let mut router = Router::new();
        router.get("/items/:id", |req: Request| {
            format!(
                "{} {}",
                req.param("id").unwrap_or(""),
                req.param("page").unwrap_or("")
            )
        });
        assert_eq!(
            body(router.handle(make_request("GET", "/items/7?id=query&page=3"))),
            "7 3"
        );
    }

    #[test]
    fn method_variants_registered() {
        let mut router = Router::new();
        router
            .put("/r", |_req: Request| StatusCode::OK)
            .delete("/r", |_req: Request| StatusCode::OK)
            .patch("/r", |_req: Request| StatusCode::OK)
            .options("/r", |_req: Request| StatusCode::OK);
        assert_eq!(router.len(), 4);
        for method in ["PUT", "DELETE", "PATCH", "OPTIONS"] {
            assert_eq!(
                router.handle(make_request(method, "/r")).status(),
                StatusCode::OK
            );
        }
    }

    #[test]
    fn mounted_router_sees_suffix() {
        let mut users = Router::new();
        users.get("/:id", |req: Request| {
            let env = req.env();
            format!(
                "{} {} {} {}",
                req.uri().path(),
                req.param("id").unwrap_or(""),
                env.context_path(),
                env.original_uri.as_ref().map(|u| u.path().to_owned()).unwrap_or_default()
            )
        });
        let mut api = Router::new();
        api.mount("/users", users);
        let mut root = Router::new();
        root.mount("/api/:version", api);

        let out = body(root.handle(make_request("GET", "/api/v2/users/42")));
        assert_eq!(out, "/42 42 /api/v2/users /api/v2/users/42");
    }

    #[test]
    fn mount_captures_recorded() {
        let mut inner = Router::new();
        inner.get("/", |req: Request| {
            req.env().context_params.get("tenant").unwrap_or("").to_owned()
        });
        let mut root = Router::new();
        root.mount("/t/:tenant/", inner);
        assert_eq!(body(root.handle(make_request("GET", "/t/acme"))), "acme");
    }

    #[test]
    fn unmatched_mount_falls_through() {
        let mut inner = Router::new();
        inner.get("/only", |_req: Request| StatusCode::OK);
        let mut root = Router::new();
        root.mount("/sub", inner);
        root.get("/sub/other", |req: Request| {
            let env = req.env();
            assert!(env.context.is_empty());
            assert!(env.original_uri.is_none());
            req.uri().path().to_owned()
        });
        assert_eq!(body(root.handle(make_request("GET", "/sub/other"))), "/sub/other");
        assert_eq!(
            root.handle(make_request("GET", "/sub/missing")).status(),
            StatusCode::NOT_FOUND
        );
    }
}
