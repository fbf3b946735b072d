use crate::resource::model::{
    PermissionSet, ResourceError, ResourceNode, ResourceOp, Role, User, PERM_READ, PERM_WRITE,
};
use log::{debug, warn};

pub struct PermissionManager;

impl PermissionManager {
    /// 检查用户对节点的操作权限
    pub fn check(user: &User, node: &ResourceNode, op: &ResourceOp) -> Result<(), ResourceError> {
        debug!(
            "权限检查 - 用户: {}, 节点: {}, 操作: {:?}",
            user.username, node.name, op
        );

        // Admin 角色拥有所有权限
        if user.roles.contains(&Role::Admin) {
            debug!("用户是管理员，允许所有操作");
            return Ok(());
        }

        // Guest 用户只有读权限
        if user.roles.contains(&Role::Guest) && op != &ResourceOp::Read {
            warn!("访客用户 {} 尝试执行 {:?}", user.username, op);
            return Err(ResourceError::PermissionError("访客用户只有读权限".to_string()));
        }

        let required_perm = match op {
            ResourceOp::Read => PERM_READ,
            ResourceOp::Create | ResourceOp::Update | ResourceOp::Delete => PERM_WRITE,
        };

        let is_owner = user.id == node.owner_id;
        debug!("是否是节点所有者: {}", is_owner);

        // 这里简化处理，没有用户组，非所有者一律按 other 位判断
        let granted = if is_owner {
            node.permissions.owner()
        } else {
            node.permissions.other()
        };

        if (granted & required_perm) != required_perm {
            return Err(ResourceError::PermissionError(format!(
                "用户 {} 没有对 {} 执行 {:?} 操作的权限",
                user.username, node.name, op
            )));
        }

        Ok(())
    }
}

pub trait PermissionResolver: Send + Sync {
    /// 新建资源在父节点下应得的权限
    fn permissions_for(&self, parent: &ResourceNode) -> PermissionSet;
}

/// 新资源沿用父目录的权限
#[derive(Debug, Default, Clone, Copy)]
pub struct InheritedPermissions;

impl PermissionResolver for InheritedPermissions {
    fn permissions_for(&self, parent: &ResourceNode) -> PermissionSet {
        parent.permissions
    }
}
