//! vSphere SOAP fault inspection.
//!
//! vCenter reports missing privileges as a SOAP fault whose `detail` carries a
//! `NoPermissionFault` element from the `urn:vim25` namespace:
//!
//! ```xml
//! <soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
//!   <soapenv:Body>
//!     <soapenv:Fault>
//!       <detail>
//!         <NoPermissionFault xmlns="urn:vim25" xsi:type="NoPermission">
//!           <object type="Folder">group-v23485</object>
//!           <privilegeId>VirtualMachine.Interact.PowerOn</privilegeId>
//!         </NoPermissionFault>
//!       </detail>
//!     </soapenv:Fault>
//!   </soapenv:Body>
//! </soapenv:Envelope>
//! ```
//!
//! Anything that is not well-formed XML is simply "not a fault"; none of the
//! functions here return errors.

use roxmltree::{Document, Node};

/// SOAP 1.1 envelope namespace.
pub const SOAPENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// vSphere API namespace.
pub const VIM25_NS: &str = "urn:vim25";

/// `(namespace, local name)` of one step in an element path.
type Step = (Option<&'static str>, &'static str);

const FAULT_PATH: &[Step] = &[
    (Some(SOAPENV_NS), "Body"),
    (Some(SOAPENV_NS), "Fault"),
    (None, "detail"),
    (Some(VIM25_NS), "NoPermissionFault"),
];

/// Fields of a `NoPermissionFault` needed for the flat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionFault {
    /// `type` attribute of the faulting managed object (e.g. `Folder`).
    pub object_type: Option<String>,
    /// Managed object reference (e.g. `group-v23485`).
    pub object_name: Option<String>,
    /// Privilege the session was missing.
    pub privilege_id: Option<String>,
}

/// Check whether a response is a vSphere `NoPermissionFault`.
///
/// Successful (200) responses are never faults, whatever their body says.
pub fn is_permission_fault(status_code: u16, body: &[u8]) -> bool {
    if status_code == 200 {
        return false;
    }
    has_permission_fault(body)
}

/// Check a response body for a `NoPermissionFault`, ignoring the status code.
pub fn has_permission_fault(body: &[u8]) -> bool {
    let Some(text) = as_text(body) else {
        return false;
    };
    match Document::parse(text) {
        Ok(doc) => find_path(doc.root_element(), FAULT_PATH).is_some(),
        Err(_) => false,
    }
}

/// Extract the object and privilege from a `NoPermissionFault` body.
///
/// Returns `None` unless both `object` and `privilegeId` are present.
pub fn extract_permission_fault(body: &[u8]) -> Option<PermissionFault> {
    let text = as_text(body)?;
    let doc = Document::parse(text).ok()?;
    let fault = find_path(doc.root_element(), FAULT_PATH)?;

    let object = find_path(fault, &[(Some(VIM25_NS), "object")])?;
    let privilege = find_path(fault, &[(Some(VIM25_NS), "privilegeId")])?;

    Some(PermissionFault {
        object_type: object.attribute("type").map(str::to_string),
        object_name: object.text().map(str::to_string),
        privilege_id: privilege.text().map(str::to_string),
    })
}

fn as_text(body: &[u8]) -> Option<&str> {
    std::str::from_utf8(body).ok()
}

/// Walk `path` from `node`, trying every matching child at each step.
/// Returns the first hit in document order.
fn find_path<'a, 'input>(node: Node<'a, 'input>, path: &[Step]) -> Option<Node<'a, 'input>> {
    let Some(((ns, name), rest)) = path.split_first() else {
        return Some(node);
    };
    node.children()
        .filter(|child| {
            child.is_element()
                && child.tag_name().name() == *name
                && child.tag_name().namespace() == *ns
        })
        .find_map(|child| find_path(child, rest))
}
