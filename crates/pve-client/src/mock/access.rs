//! Access control operations for MockPveClient
//!
//! Handles roles, groups, users, ACL entries and API tokens

use super::{MockAcl, MockPveClient, lock};
use crate::error::PveError;
use crate::models::*;

pub async fn list_roles(client: &MockPveClient) -> Result<Vec<Role>, PveError> {
    client.check("list_roles")?;
    Ok(lock(&client.roles).values().cloned().collect())
}

pub async fn create_role(client: &MockPveClient, roleid: &str, privs: &[String]) -> Result<(), PveError> {
    client.check("create_role")?;
    let mut roles = lock(&client.roles);
    if roles.contains_key(roleid) {
        return Err(PveError::Api {
            status: 500,
            message: format!("role '{}' already exists", roleid),
        });
    }
    roles.insert(
        roleid.to_string(),
        Role {
            roleid: roleid.to_string(),
            privs: privs.join(","),
            special: false,
        },
    );
    drop(roles);

    client.record(format!("create_role:{}", roleid));
    Ok(())
}

pub async fn update_role(client: &MockPveClient, roleid: &str, privs: &[String]) -> Result<(), PveError> {
    client.check("update_role")?;
    let mut roles = lock(&client.roles);
    let role = roles
        .get_mut(roleid)
        .ok_or_else(|| PveError::NotFound(format!("role '{}' does not exist", roleid)))?;
    role.privs = privs.join(",");
    drop(roles);

    client.record(format!("update_role:{}", roleid));
    Ok(())
}

pub async fn list_groups(client: &MockPveClient) -> Result<Vec<Group>, PveError> {
    client.check("list_groups")?;
    Ok(lock(&client.groups).values().cloned().collect())
}

pub async fn create_group(client: &MockPveClient, groupid: &str, comment: Option<&str>) -> Result<(), PveError> {
    client.check("create_group")?;
    let mut groups = lock(&client.groups);
    if groups.contains_key(groupid) {
        return Err(PveError::Api {
            status: 500,
            message: format!("group '{}' already exists", groupid),
        });
    }
    groups.insert(
        groupid.to_string(),
        Group {
            groupid: groupid.to_string(),
            comment: comment.map(str::to_string),
        },
    );
    drop(groups);

    client.record(format!("create_group:{}", groupid));
    Ok(())
}

pub async fn list_users(client: &MockPveClient) -> Result<Vec<User>, PveError> {
    client.check("list_users")?;
    Ok(lock(&client.users).values().cloned().collect())
}

pub async fn create_user(client: &MockPveClient, userid: &str, groups: &[String], comment: Option<&str>) -> Result<(), PveError> {
    client.check("create_user")?;
    let mut users = lock(&client.users);
    if users.contains_key(userid) {
        return Err(PveError::Api {
            status: 500,
            message: format!("user '{}' already exists", userid),
        });
    }
    users.insert(
        userid.to_string(),
        User {
            userid: userid.to_string(),
            groups: (!groups.is_empty()).then(|| groups.join(",")),
            comment: comment.map(str::to_string),
        },
    );
    drop(users);

    client.record(format!("create_user:{}", userid));
    Ok(())
}

pub async fn set_acl(client: &MockPveClient, path: &str, roles: &[String], groups: &[String], propagate: bool) -> Result<(), PveError> {
    client.check("set_acl")?;
    let entry = MockAcl {
        path: path.to_string(),
        roles: roles.to_vec(),
        groups: groups.to_vec(),
        propagate,
    };
    let mut acls = lock(&client.acls);
    if !acls.contains(&entry) {
        acls.push(entry);
    }
    drop(acls);

    client.record(format!("set_acl:{}", path));
    Ok(())
}

pub async fn list_tokens(client: &MockPveClient, userid: &str) -> Result<Vec<ApiToken>, PveError> {
    client.check("list_tokens")?;
    if !lock(&client.users).contains_key(userid) {
        return Err(PveError::NotFound(format!("user '{}' does not exist", userid)));
    }
    Ok(client.tokens_for(userid))
}

pub async fn create_token(client: &MockPveClient, userid: &str, tokenid: &str, privsep: bool, comment: Option<&str>) -> Result<CreatedToken, PveError> {
    client.check("create_token")?;
    if !lock(&client.users).contains_key(userid) {
        return Err(PveError::NotFound(format!("user '{}' does not exist", userid)));
    }

    let mut tokens = lock(&client.tokens);
    let user_tokens = tokens.entry(userid.to_string()).or_default();
    if user_tokens.iter().any(|t| t.tokenid == tokenid) {
        return Err(PveError::Api {
            status: 500,
            message: format!("Token already exists for '{}'", userid),
        });
    }
    user_tokens.push(ApiToken {
        tokenid: tokenid.to_string(),
        privsep,
        comment: comment.map(str::to_string),
    });
    drop(tokens);

    client.record(format!("create_token:{}!{}", userid, tokenid));
    Ok(CreatedToken {
        full_tokenid: format!("{}!{}", userid, tokenid),
        value: format!("mock-secret-{}", tokenid),
    })
}
