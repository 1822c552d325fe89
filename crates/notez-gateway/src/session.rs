use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, warn};

use notez_types::api::Claims;
use notez_types::models::Identity;

use crate::error::{GatewayError, GatewayResult};
use crate::store::Services;

/// Turns a bearer token into a verified, active identity.
#[derive(Clone)]
pub struct SessionGate {
    services: Services,
    decoding_key: DecodingKey,
}

impl SessionGate {
    pub fn new(services: Services, jwt_secret: &str) -> Self {
        Self {
            services,
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    /// Verify the token and the user behind it.
    ///
    /// Rejects malformed, badly signed or expired tokens, unknown users and
    /// deactivated users. On success the user's last-active marker is bumped
    /// in the background.
    pub async fn authenticate(&self, token: &str) -> GatewayResult<Identity> {
        let claims = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| {
                debug!("Rejected gateway token: {}", e);
                GatewayError::Unauthenticated
            })?
            .claims;

        let user = match self.services.user(claims.sub).await? {
            Some(user) => user,
            None => {
                debug!("Token for unknown user {}", claims.sub);
                return Err(GatewayError::Unauthenticated);
            }
        };
        if !user.is_active {
            debug!("Token for deactivated user {} ({})", user.username, user.id);
            return Err(GatewayError::Unauthenticated);
        }

        let services = self.services.clone();
        let user_id = user.id;
        tokio::spawn(async move {
            if let Err(e) = services.touch_last_active(user_id).await {
                warn!("Failed to record last activity for {}: {}", user_id, e);
            }
        });

        Ok(Identity {
            user_id: user.id,
            username: user.username,
        })
    }
}
