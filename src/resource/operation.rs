use crate::resource::model::{NodeId, ResourceError, ResourceNode};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 资源操作请求，替代按字符串分发的事件名。
///
/// 只携带节点 id，文件内容一律通过上传接口进入服务端。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOperation {
    Copy(CopyFile),
    Delete(DeleteNode),
    List(ListDir),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyFile {
    pub node_id: NodeId,
    pub target_parent_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNode {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListDir {
    pub parent_id: NodeId,
}

impl FileOperation {
    pub fn name(&self) -> &'static str {
        match self {
            FileOperation::Copy(_) => "copy",
            FileOperation::Delete(_) => "delete",
            FileOperation::List(_) => "list",
        }
    }
}

/// 上传参数，文件内容在请求体中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct UploadFile {
    pub parent_id: NodeId,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    /// 为 true 且文件是 zip 时按压缩包导入
    #[serde(default)]
    pub uncompress: bool,
}

impl UploadFile {
    /// 校验请求参数
    pub fn check(&self) -> Result<(), ResourceError> {
        self.validate()
            .map_err(|e| ResourceError::InvalidOperation(format!("参数错误: {}", e)))?;
        check_name(&self.name)
    }
}

fn check_name(name: &str) -> Result<(), ResourceError> {
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(ResourceError::InvalidOperation(format!("非法的文件名: {}", name)));
    }
    Ok(())
}

/// 操作结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OperationOutcome {
    Created { nodes: Vec<ResourceNode> },
    Copied { node: ResourceNode },
    Updated { node: ResourceNode },
    Deleted { node_id: NodeId, removed_files: usize },
    Listed { nodes: Vec<ResourceNode> },
}

impl OperationOutcome {
    pub fn summary(&self) -> String {
        match self {
            OperationOutcome::Created { nodes } => format!("创建了 {} 个资源", nodes.len()),
            OperationOutcome::Copied { node } => format!("已复制为 {}", node.name),
            OperationOutcome::Updated { node } => format!("已更新 {}", node.name),
            OperationOutcome::Deleted {
                node_id,
                removed_files,
            } => format!("已删除节点 {}，清理 {} 个文件", node_id, removed_files),
            OperationOutcome::Listed { nodes } => format!("共 {} 项", nodes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_operations() {
        let op: FileOperation =
            serde_json::from_str(r#"{"op": "copy", "node_id": 7, "target_parent_id": 2}"#).unwrap();
        assert_eq!(
            op,
            FileOperation::Copy(CopyFile {
                node_id: 7,
                target_parent_id: 2,
            })
        );
        assert_eq!(op.name(), "copy");
    }

    #[test]
    fn path_carrying_operations_are_rejected() {
        for body in [
            r#"{"op": "create", "parent_id": 1, "name": "a.txt", "source_path": "/etc/passwd"}"#,
            r#"{"op": "import", "parent_id": 1, "archive_path": "/etc/passwd"}"#,
            r#"{"op": "rename", "node_id": 1}"#,
        ] {
            assert!(serde_json::from_str::<FileOperation>(body).is_err(), "{}", body);
        }
    }

    #[test]
    fn upload_defaults_to_keeping_archives() {
        let upload: UploadFile =
            serde_json::from_str(r#"{"parent_id": 1, "name": "a.zip"}"#).unwrap();
        assert!(!upload.uncompress);
    }

    #[test]
    fn upload_rejects_bad_names() {
        let upload = |name: &str| UploadFile {
            parent_id: 1,
            name: name.to_string(),
            uncompress: false,
        };

        assert!(upload("notes.txt").check().is_ok());
        assert!(matches!(
            upload("").check(),
            Err(ResourceError::InvalidOperation(_))
        ));
        assert!(upload("../etc").check().is_err());
        assert!(upload("a\\b").check().is_err());
        assert!(upload(&"x".repeat(256)).check().is_err());
    }
}
