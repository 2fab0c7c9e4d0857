use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use docuflow_core::OwnerId;

use crate::context::{OwnerContext, OwnerRole};

/// Header carrying the authenticated user id, set by the session layer in
/// front of this service.
pub const OWNER_ID_HEADER: &str = "x-owner-id";

/// Optional role header; `admin` grants cross-owner visibility.
pub const OWNER_ROLE_HEADER: &str = "x-owner-role";

pub async fn owner_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let context = extract_owner(req.headers())?;
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

fn extract_owner(headers: &HeaderMap) -> Result<OwnerContext, StatusCode> {
    let header = headers
        .get(OWNER_ID_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let owner_id: OwnerId = header
        .trim()
        .parse()
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let role = match headers.get(OWNER_ROLE_HEADER) {
        Some(value) if matches!(value.to_str(), Ok(s) if s.trim() == "admin") => OwnerRole::Admin,
        _ => OwnerRole::Member,
    };

    Ok(OwnerContext::new(owner_id, role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert_eq!(extract_owner(&headers), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn garbage_owner_id_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert(OWNER_ID_HEADER, "not-a-uuid".parse().unwrap());
        assert_eq!(extract_owner(&headers), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn role_header_controls_admin() {
        let owner = OwnerId::new();
        let mut headers = HeaderMap::new();
        headers.insert(OWNER_ID_HEADER, owner.to_string().parse().unwrap());

        let context = extract_owner(&headers).unwrap();
        assert!(!context.is_admin());
        assert_eq!(context.owner_id(), owner);

        headers.insert(OWNER_ROLE_HEADER, "admin".parse().unwrap());
        assert!(extract_owner(&headers).unwrap().is_admin());
    }
}
