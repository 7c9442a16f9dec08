mod handler;
pub(crate) mod model;

pub use handler::{
    add_members, create_group, delete_group, invite_member, leave_group, list_groups,
    remove_member,
};
pub use model::{
    AddMembersRequest, AddMembersResponse, CreateGroupRequest, GroupInfo, GroupListItem,
    InviteRequest, RemoveMemberRequest,
};

pub(crate) use model::{display_name_of, load_active_group, require_member};
