//! Role records: self sign-up and admin-only account provisioning.

use chrono::{DateTime, Utc};
use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{User, UserRole};
use crate::service::{clean_text, Registry};
use crate::store::Store;

const MIN_PASSWORD_LEN: usize = 6;
const MAX_DISPLAY_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailUserRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneUserRequest {
    pub phone_number: Option<String>,
    pub password: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedUser {
    pub success: bool,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

fn required<'a>(value: &'a Option<String>, message: &str) -> AppResult<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(message.to_string()))
}

pub fn validate_email(email: &str) -> AppResult<String> {
    let email = email.trim();
    let re = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if !re.is_match(email) {
        return Err(AppError::Validation("email is not a valid address".to_string()));
    }
    Ok(email.to_lowercase())
}

/// E.164: a plus sign, then 2 to 15 digits with no leading zero.
pub fn validate_phone(phone: &str) -> AppResult<String> {
    let phone = phone.trim();
    let re = Regex::new(r"^\+[1-9]\d{1,14}$").map_err(|e| AppError::Internal(e.to_string()))?;
    if !re.is_match(phone) {
        return Err(AppError::Validation(
            "phone number must be in E.164 format (e.g., +1234567890)".to_string(),
        ));
    }
    Ok(phone.to_string())
}

fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_display_name(value: &Option<String>) -> AppResult<String> {
    let name = required(value, "display name is required")?;
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(AppError::Validation(format!(
            "display name must be at most {MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_role(value: &Option<String>) -> AppResult<UserRole> {
    match value.as_deref() {
        Some("admin") => Ok(UserRole::Admin),
        Some("guest") => Ok(UserRole::Guest),
        _ => Err(AppError::Validation(
            "role must be either \"admin\" or \"guest\"".to_string(),
        )),
    }
}

fn hash_password(password: &str) -> AppResult<String> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

fn new_uid() -> String {
    Uuid::new_v4().simple().to_string()
}

impl<S: Store> Registry<S> {
    /// Creates the caller's own guest record. The uid is the one the
    /// identity provider vouched for.
    pub fn sign_up(
        &self,
        uid: &str,
        request: SignUpRequest,
        now: DateTime<Utc>,
    ) -> AppResult<User> {
        if self.store.find_user(uid)?.is_some() {
            return Err(AppError::AlreadyExists(format!("user {uid}")));
        }
        let user = User {
            uid: uid.to_string(),
            email: validate_email(&request.email)?,
            phone: None,
            display_name: clean_text(request.display_name),
            role: UserRole::Guest,
            password_hash: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user)?;
        info!("user {uid} signed up");
        Ok(user)
    }

    /// Idempotent: an existing record for `uid` is returned untouched.
    pub fn ensure_admin(
        &self,
        uid: &str,
        email: &str,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<User> {
        if let Some(existing) = self.store.find_user(uid)? {
            return Ok(existing);
        }
        let user = User {
            uid: uid.to_string(),
            email: validate_email(email)?,
            phone: None,
            display_name: clean_text(display_name),
            role: UserRole::Admin,
            password_hash: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user)?;
        info!("bootstrap admin {uid} created");
        Ok(user)
    }

    pub fn users(&self, caller: &Principal) -> AppResult<Vec<User>> {
        caller.require_admin()?;
        self.store.list_users()
    }

    pub fn create_email_user(
        &self,
        caller: &Principal,
        request: EmailUserRequest,
        now: DateTime<Utc>,
    ) -> AppResult<ProvisionedUser> {
        caller.require_admin()?;
        let email = validate_email(required(&request.email, "email is required")?)?;
        let password = request.password.as_deref().unwrap_or_default();
        validate_password(password)?;
        let display_name = validate_display_name(&request.display_name)?;
        let role = validate_role(&request.role)?;
        let phone = match clean_text(request.phone) {
            Some(p) => Some(validate_phone(&p)?),
            None => None,
        };

        let user = User {
            uid: new_uid(),
            email: email.clone(),
            phone,
            display_name: Some(display_name),
            role,
            password_hash: Some(hash_password(password)?),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user)?;
        info!("user created by admin {}: {}", caller.uid(), user.uid);

        Ok(ProvisionedUser {
            success: true,
            uid: user.uid,
            email: Some(email),
            phone_number: None,
        })
    }

    /// Phone accounts use the phone number as their email identity.
    pub fn create_phone_user(
        &self,
        caller: &Principal,
        request: PhoneUserRequest,
        now: DateTime<Utc>,
    ) -> AppResult<ProvisionedUser> {
        caller.require_admin()?;
        let phone = validate_phone(required(&request.phone_number, "phone number is required")?)?;
        let display_name = validate_display_name(&request.display_name)?;
        let role = validate_role(&request.role)?;
        let password_hash = match request.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => {
                validate_password(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };

        let user = User {
            uid: new_uid(),
            email: phone.clone(),
            phone: Some(phone.clone()),
            display_name: Some(display_name),
            role,
            password_hash,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user)?;
        info!("phone user created by admin {}: {}", caller.uid(), user.uid);

        Ok(ProvisionedUser {
            success: true,
            uid: user.uid,
            email: None,
            phone_number: Some(phone),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{add_user, clock, setup};

    fn email_request(email: &str, password: &str, role: &str) -> EmailUserRequest {
        EmailUserRequest {
            email: Some(email.into()),
            password: Some(password.into()),
            display_name: Some("Grace Hopper".into()),
            role: Some(role.into()),
            phone: None,
        }
    }

    #[test]
    fn phone_numbers_must_be_e164() {
        assert!(validate_phone("+14155552671").is_ok());
        assert!(validate_phone("+12").is_ok());
        assert!(validate_phone("+1").is_err());
        assert!(validate_phone("+0123456").is_err());
        assert!(validate_phone("14155552671").is_err());
        assert!(validate_phone("+1234567890123456").is_err());
    }

    #[test]
    fn emails_are_normalised() {
        assert_eq!(validate_email(" Ada@Example.COM ").unwrap(), "ada@example.com");
        assert!(validate_email("ada.example.com").is_err());
        assert!(validate_email("ada@example").is_err());
    }

    #[test]
    fn provisioning_is_admin_only() {
        let (registry, _) = setup();
        let guest = add_user(&registry, "alice", UserRole::Guest);
        assert!(matches!(
            registry.create_email_user(
                &guest,
                email_request("g@example.com", "secret1", "guest"),
                clock(),
            ),
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[test]
    fn email_accounts_validate_every_field() {
        let (registry, admin) = setup();
        let short = email_request("g@example.com", "12345", "guest");
        assert!(matches!(
            registry.create_email_user(&admin, short, clock()),
            Err(AppError::Validation(_))
        ));
        let role = email_request("g@example.com", "secret1", "owner");
        assert!(matches!(
            registry.create_email_user(&admin, role, clock()),
            Err(AppError::Validation(_))
        ));
        let mut nameless = email_request("g@example.com", "secret1", "guest");
        nameless.display_name = Some("   ".into());
        assert!(matches!(
            registry.create_email_user(&admin, nameless, clock()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn email_accounts_store_a_password_hash() {
        let (registry, admin) = setup();
        let created = registry
            .create_email_user(
                &admin,
                email_request("grace@example.com", "secret1", "admin"),
                clock(),
            )
            .unwrap();
        assert!(created.success);
        assert_eq!(created.email.as_deref(), Some("grace@example.com"));

        let stored = registry.store.find_user(&created.uid).unwrap().unwrap();
        assert_eq!(stored.role, UserRole::Admin);
        let hash = stored.password_hash.unwrap();
        assert!(bcrypt::verify("secret1", &hash).unwrap());

        let json = serde_json::to_value(&created).unwrap();
        assert!(json.get("phoneNumber").is_none());
    }

    #[test]
    fn phone_accounts_use_the_number_as_email() {
        let (registry, admin) = setup();
        let created = registry
            .create_phone_user(
                &admin,
                PhoneUserRequest {
                    phone_number: Some("+4915112345678".into()),
                    password: None,
                    display_name: Some("Kim".into()),
                    role: Some("guest".into()),
                },
                clock(),
            )
            .unwrap();
        assert_eq!(created.phone_number.as_deref(), Some("+4915112345678"));

        let stored = registry.store.find_user(&created.uid).unwrap().unwrap();
        assert_eq!(stored.email, "+4915112345678");
        assert!(stored.password_hash.is_none());
    }

    #[test]
    fn sign_up_creates_a_guest_once() {
        let (registry, _) = setup();
        let user = registry
            .sign_up(
                "newcomer",
                SignUpRequest {
                    email: "new@example.com".into(),
                    display_name: Some("New".into()),
                },
                clock(),
            )
            .unwrap();
        assert_eq!(user.role, UserRole::Guest);

        let again = registry.sign_up(
            "newcomer",
            SignUpRequest {
                email: "other@example.com".into(),
                display_name: None,
            },
            clock(),
        );
        assert!(matches!(again, Err(AppError::AlreadyExists(_))));
    }

    #[test]
    fn bootstrap_admin_is_idempotent() {
        let (registry, _) = setup();
        let first = registry.ensure_admin("root", "root@example.com", None, clock()).unwrap();
        let second = registry.ensure_admin("root", "root@example.com", None, clock()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.role, UserRole::Admin);
    }
}
